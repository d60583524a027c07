pub mod config;
pub mod envsubst;
pub mod matchers;
pub mod observability;
