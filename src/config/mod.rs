pub mod schema;

pub use schema::{default_config_path, Config, RequestReplyConfig};

use crate::transport::StaticDestinationResolver;

/// Destination resolver backed by the `[bindings]` table.
pub fn resolver_from(config: &Config) -> StaticDestinationResolver {
    StaticDestinationResolver::new(config.bindings.clone())
}
