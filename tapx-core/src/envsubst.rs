use anyhow::{anyhow, Result};
use regex::Regex;
use std::env;

pub fn expand_env(input: &str) -> Result<String> {
    let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-(.*?))?\}")?;
    let mut out = String::with_capacity(input.len());
    let mut last = 0;
    for caps in re.captures_iter(input) {
        let m = caps
            .get(0)
            .ok_or_else(|| anyhow!("envsubst capture error"))?;
        out.push_str(&input[last..m.start()]);
        let key = caps.get(1).unwrap().as_str();
        let default = caps.get(2).map(|m| m.as_str());
        let value = match env::var(key) {
            Ok(v) => v,
            Err(_) => match default {
                Some(d) => d.to_string(),
                None => return Err(anyhow!("missing environment variable: {}", key)),
            },
        };
        out.push_str(&value);
        last = m.end();
    }
    out.push_str(&input[last..]);
    Ok(out)
}
