//! gRPC client for the skiff daemon.

use anyhow::{Context, Result};
use tokio_stream::Stream;
use tonic::transport::{Channel, Endpoint};

use skiff_api::skiff::v1::skiff_service_client::SkiffServiceClient;
use skiff_api::skiff::v1::{
    GetLogsRequest, GetLogsResponse, GetVersionRequest, GetVersionResponse, UpMessage,
};

/// Client handle for one daemon connection.
///
/// Constructed per command and passed down explicitly; there is no ambient
/// connection state.
pub struct SkiffClient {
    client: SkiffServiceClient<Channel>,
}

impl SkiffClient {
    /// Connect to the daemon at `addr` (host:port).
    pub async fn connect(addr: &str) -> Result<Self> {
        let channel = Endpoint::try_from(format!("http://{}", addr))?
            .connect()
            .await
            .with_context(|| format!("failed to connect to skiffd at {}. Is the daemon running?", addr))?;

        Ok(Self { client: SkiffServiceClient::new(channel) })
    }

    /// One upload, one stream of summaries.
    pub async fn up_build(&mut self, msg: UpMessage) -> Result<tonic::Streaming<UpMessage>> {
        let response = self.client.up_build(tonic::Request::new(msg)).await?;
        Ok(response.into_inner())
    }

    /// Watch mode: many uploads over one connection, summaries interleaved
    /// on the single response stream.
    pub async fn up_stream(
        &mut self,
        requests: impl Stream<Item = UpMessage> + Send + 'static,
    ) -> Result<tonic::Streaming<UpMessage>> {
        let response = self.client.up_stream(tonic::Request::new(requests)).await?;
        Ok(response.into_inner())
    }

    /// Fetch persisted logs for one build.
    pub async fn get_logs(&mut self, app_name: &str, build_id: &str, limit: i64) -> Result<GetLogsResponse> {
        let request = tonic::Request::new(GetLogsRequest {
            app_name: app_name.to_string(),
            build_id: build_id.to_string(),
            limit,
        });

        let response = self.client.get_logs(request).await?;
        Ok(response.into_inner())
    }

    /// Server version.
    pub async fn version(&mut self) -> Result<GetVersionResponse> {
        let response = self.client.get_version(tonic::Request::new(GetVersionRequest {})).await?;
        Ok(response.into_inner())
    }
}
