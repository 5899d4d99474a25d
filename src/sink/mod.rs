//! Sink side of the pipeline: OAuth2 token management, the streaming
//! transport, and the self-healing stream session bound to one
//! `(catalog, schema, table)` target.

pub mod session;
pub mod token;
pub mod transport;

pub use session::{is_fatal_state_error, StreamSession};
pub use token::{OAuthClientCredentials, Token, TokenFetcher, TokenManager, ZerobusScope};
pub use transport::{HttpTransportFactory, SinkTransport, TransportFactory};

use crate::config::{StreamConfig, TargetConfig};

/// Everything needed to address one sink table.
#[derive(Debug, Clone)]
pub struct SinkTarget {
    pub workspace_host: String,
    pub zerobus_endpoint: String,
    pub table: TargetConfig,
    pub stream: StreamConfig,
}

impl SinkTarget {
    /// `catalog.schema.table`, as carried in the per-request table header.
    pub fn table_name(&self) -> String {
        self.table.table_name()
    }
}

/// Header carrying the target table on every sink request.
pub const TABLE_HEADER: &str = "x-databricks-zerobus-table-name";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_name_joins_three_parts() {
        let target = SinkTarget {
            workspace_host: "https://dbc-x.cloud.databricks.com".into(),
            zerobus_endpoint: "123.zerobus.us-east-1.cloud.databricks.com".into(),
            table: TargetConfig {
                catalog: "main".into(),
                schema: "iot".into(),
                table: "telemetry".into(),
            },
            stream: StreamConfig::default(),
        };
        assert_eq!(target.table_name(), "main.iot.telemetry");
    }
}
