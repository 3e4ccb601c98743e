//! gRPC client for the GPU helper binary. The helper's .proto lives with the
//! helper; this module hand-writes the message subset the monitor consumes
//! and issues unary calls directly, which is exactly what generated client
//! code would do.

use anyhow::{Context, Result};
use tonic::client::Grpc;
use tonic::codec::ProstCodec;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::{Channel, Endpoint};

use super::portfile::DialTarget;

#[derive(Clone, PartialEq, prost::Message)]
pub struct GetStatsRequest {
    /// Process whose GPU usage is attributed.
    #[prost(uint32, tag = "1")]
    pub pid: u32,
    /// Restrict to these device indices; empty means all.
    #[prost(uint32, repeated, tag = "2")]
    pub device_ids: Vec<u32>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct StatsEntry {
    #[prost(string, tag = "1")]
    pub key: String,
    #[prost(string, tag = "2")]
    pub value_json: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct GetStatsResponse {
    #[prost(message, repeated, tag = "1")]
    pub entries: Vec<StatsEntry>,
    /// Microseconds since the Unix epoch; 0 means "now".
    #[prost(int64, tag = "2")]
    pub timestamp_us: i64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct GetMetadataRequest {}

#[derive(Clone, PartialEq, prost::Message)]
pub struct GetMetadataResponse {
    /// JSON-encoded environment fragment (GPU inventories, counts, type).
    #[prost(string, tag = "1")]
    pub metadata_json: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct TearDownRequest {}

#[derive(Clone, PartialEq, prost::Message)]
pub struct TearDownResponse {}

const GET_STATS: &str = "/gpuhelper.v1.GpuHelper/GetStats";
const GET_METADATA: &str = "/gpuhelper.v1.GpuHelper/GetMetadata";
const TEAR_DOWN: &str = "/gpuhelper.v1.GpuHelper/TearDown";

/// Thin unary client over the helper's channel. Cloning shares the channel.
#[derive(Debug, Clone)]
pub struct GpuHelperClient {
    inner: Grpc<Channel>,
}

impl GpuHelperClient {
    /// Dial the target the portfile described.
    pub async fn connect(target: &DialTarget) -> Result<Self> {
        let channel = match target {
            DialTarget::Tcp(port) => Endpoint::try_from(format!("http://127.0.0.1:{port}"))
                .context("invalid helper endpoint")?
                .connect()
                .await
                .context("dialing GPU helper over TCP")?,
            DialTarget::Unix(path) => {
                let path = path.clone();
                // The endpoint URI is required by the builder but unused; the
                // connector dials the socket directly.
                Endpoint::try_from("http://[::1]:0")
                    .context("invalid helper endpoint")?
                    .connect_with_connector(tower::service_fn(move |_: tonic::transport::Uri| {
                        let path = path.clone();
                        async move {
                            let stream = tokio::net::UnixStream::connect(path).await?;
                            Ok::<_, std::io::Error>(hyper_util::rt::TokioIo::new(stream))
                        }
                    }))
                    .await
                    .context("dialing GPU helper over unix socket")?
            }
        };
        Ok(Self {
            inner: Grpc::new(channel),
        })
    }

    async fn unary<Req, Resp>(&mut self, path: &'static str, request: Req) -> Result<Resp, tonic::Status>
    where
        Req: prost::Message + 'static,
        Resp: prost::Message + Default + 'static,
    {
        self.inner
            .ready()
            .await
            .map_err(|e| tonic::Status::unavailable(format!("helper channel not ready: {e}")))?;
        let codec: ProstCodec<Req, Resp> = ProstCodec::default();
        let response = self
            .inner
            .unary(tonic::Request::new(request), PathAndQuery::from_static(path), codec)
            .await?;
        Ok(response.into_inner())
    }

    pub async fn get_stats(
        &mut self,
        pid: u32,
        device_ids: &[u32],
    ) -> Result<GetStatsResponse, tonic::Status> {
        self.unary(
            GET_STATS,
            GetStatsRequest {
                pid,
                device_ids: device_ids.to_vec(),
            },
        )
        .await
    }

    pub async fn get_metadata(&mut self) -> Result<GetMetadataResponse, tonic::Status> {
        self.unary(GET_METADATA, GetMetadataRequest {}).await
    }

    /// Ask the helper to exit. Best-effort; the manager kills the process if
    /// this fails or stalls.
    pub async fn tear_down(&mut self) -> Result<TearDownResponse, tonic::Status> {
        self.unary(TEAR_DOWN, TearDownRequest {}).await
    }

    /// A cheap round-trip proving the helper is serving.
    pub async fn health_check(&mut self) -> Result<(), tonic::Status> {
        self.get_metadata().await.map(|_| ())
    }
}
