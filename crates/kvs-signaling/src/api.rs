use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::CONTENT_TYPE;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};
use url::Url;

use crate::error::{SignalingError, SignalingResult};
use crate::sigv4::SigV4Signer;

const ERROR_TYPE_HEADER: &str = "x-amzn-errortype";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChannelRole {
    Master,
    Viewer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    Wss,
    Https,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Wss => "WSS",
            Protocol::Https => "HTTPS",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ChannelInfo {
    #[serde(rename = "ChannelARN")]
    pub channel_arn: String,
    #[serde(default)]
    pub channel_name: Option<String>,
    #[serde(default)]
    pub channel_status: Option<String>,
    #[serde(default)]
    pub channel_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ResourceEndpoint {
    pub protocol: String,
    pub resource_endpoint: String,
}

/// One TURN entry as returned by `GetIceServerConfig`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct IceServerConfig {
    #[serde(default)]
    pub uris: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeSignalingChannelRequest<'a> {
    channel_name: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeSignalingChannelResponse {
    channel_info: ChannelInfo,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct GetSignalingChannelEndpointRequest<'a> {
    #[serde(rename = "ChannelARN")]
    channel_arn: &'a str,
    single_master_channel_endpoint_configuration: EndpointConfiguration<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct EndpointConfiguration<'a> {
    protocols: &'a [Protocol],
    role: ChannelRole,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct GetSignalingChannelEndpointResponse {
    #[serde(default)]
    resource_endpoint_list: Vec<ResourceEndpoint>,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct GetIceServerConfigRequest<'a> {
    #[serde(rename = "ChannelARN")]
    channel_arn: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    client_id: Option<&'a str>,
    service: &'static str,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct GetIceServerConfigResponse {
    #[serde(default)]
    ice_server_list: Vec<IceServerConfig>,
}

#[derive(Deserialize, Default)]
struct ApiErrorBody {
    #[serde(default, alias = "Message")]
    message: Option<String>,
}

/// The three control-plane calls a viewer needs before it can signal.
#[async_trait]
pub trait ChannelApi: Send + Sync {
    async fn describe_signaling_channel(&self, channel_name: &str)
    -> SignalingResult<ChannelInfo>;

    async fn get_signaling_channel_endpoint(
        &self,
        channel_arn: &str,
        role: ChannelRole,
        protocols: &[Protocol],
    ) -> SignalingResult<Vec<ResourceEndpoint>>;

    /// `https_endpoint` is the channel's own HTTPS endpoint, not the
    /// control-plane endpoint.
    async fn get_ice_server_config(
        &self,
        https_endpoint: &str,
        channel_arn: &str,
        client_id: Option<&str>,
    ) -> SignalingResult<Vec<IceServerConfig>>;
}

pub(crate) fn dns_suffix(region: &str) -> &'static str {
    if region.starts_with("cn-") {
        "amazonaws.com.cn"
    } else {
        "amazonaws.com"
    }
}

/// SigV4-signed JSON client for the signaling control plane.
#[derive(Debug, Clone)]
pub struct KinesisVideoClient {
    http: Client,
    signer: SigV4Signer,
    endpoint: Url,
}

impl KinesisVideoClient {
    pub fn new(signer: SigV4Signer) -> SignalingResult<Self> {
        let endpoint = Self::default_endpoint(signer.region())?;
        Ok(Self {
            http: Client::new(),
            signer,
            endpoint,
        })
    }

    pub fn default_endpoint(region: &str) -> SignalingResult<Url> {
        parse_url(&format!("https://kinesisvideo.{region}.{}", dns_suffix(region)))
    }

    /// Point control-plane calls at `endpoint` instead of the regional
    /// default.
    pub fn with_endpoint(mut self, endpoint: Url) -> Self {
        self.endpoint = endpoint;
        self
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    async fn post_json<Req, Resp>(
        &self,
        operation: &'static str,
        url: Url,
        request: &Req,
    ) -> SignalingResult<Resp>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let body = serde_json::to_vec(request)?;
        let headers = vec![(CONTENT_TYPE.as_str().to_string(), "application/json".to_string())];
        let signed = self
            .signer
            .sign_request("POST", &url, &headers, &body, self.signer.now());

        debug!(operation, url = %url, "calling signaling control plane");
        let mut builder = self.http.post(url).header(CONTENT_TYPE, "application/json");
        for (name, value) in signed {
            builder = builder.header(name, value);
        }
        let response = builder.body(body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let error_type = response
                .headers()
                .get(ERROR_TYPE_HEADER)
                .and_then(|value| value.to_str().ok())
                .map(|value| value.split(':').next().unwrap_or(value).to_string())
                .unwrap_or_else(|| "UnknownError".to_string());
            let text = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ApiErrorBody>(&text)
                .ok()
                .and_then(|body| body.message)
                .unwrap_or(text);
            return Err(SignalingError::Api {
                operation,
                status: status.as_u16(),
                error_type,
                message,
            });
        }
        let bytes = response.bytes().await?;
        trace!(operation, len = bytes.len(), "control plane response");
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[async_trait]
impl ChannelApi for KinesisVideoClient {
    async fn describe_signaling_channel(
        &self,
        channel_name: &str,
    ) -> SignalingResult<ChannelInfo> {
        let url = join_path(self.endpoint.as_str(), "describeSignalingChannel")?;
        let result: SignalingResult<DescribeSignalingChannelResponse> = self
            .post_json(
                "DescribeSignalingChannel",
                url,
                &DescribeSignalingChannelRequest { channel_name },
            )
            .await;
        match result {
            Ok(response) => Ok(response.channel_info),
            Err(SignalingError::Api { status: 404, .. }) => {
                Err(SignalingError::ChannelNotFound(channel_name.to_string()))
            }
            Err(SignalingError::Api { error_type, .. })
                if error_type == "ResourceNotFoundException" =>
            {
                Err(SignalingError::ChannelNotFound(channel_name.to_string()))
            }
            Err(err) => Err(err),
        }
    }

    async fn get_signaling_channel_endpoint(
        &self,
        channel_arn: &str,
        role: ChannelRole,
        protocols: &[Protocol],
    ) -> SignalingResult<Vec<ResourceEndpoint>> {
        let url = join_path(self.endpoint.as_str(), "getSignalingChannelEndpoint")?;
        let response: GetSignalingChannelEndpointResponse = self
            .post_json(
                "GetSignalingChannelEndpoint",
                url,
                &GetSignalingChannelEndpointRequest {
                    channel_arn,
                    single_master_channel_endpoint_configuration: EndpointConfiguration {
                        protocols,
                        role,
                    },
                },
            )
            .await?;
        Ok(response.resource_endpoint_list)
    }

    async fn get_ice_server_config(
        &self,
        https_endpoint: &str,
        channel_arn: &str,
        client_id: Option<&str>,
    ) -> SignalingResult<Vec<IceServerConfig>> {
        let url = join_path(https_endpoint, "v1/get-ice-server-config")?;
        let response: GetIceServerConfigResponse = self
            .post_json(
                "GetIceServerConfig",
                url,
                &GetIceServerConfigRequest {
                    channel_arn,
                    client_id,
                    service: "TURN",
                },
            )
            .await?;
        Ok(response.ice_server_list)
    }
}

fn parse_url(raw: &str) -> SignalingResult<Url> {
    Url::parse(raw).map_err(|err| SignalingError::InvalidUrl {
        url: raw.to_string(),
        reason: err.to_string(),
    })
}

fn join_path(base: &str, path: &str) -> SignalingResult<Url> {
    parse_url(&format!("{}/{path}", base.trim_end_matches('/')))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_request_uses_service_field_names() {
        let request = GetSignalingChannelEndpointRequest {
            channel_arn: "arn:aws:kinesisvideo:us-east-1:1:channel/demo/1",
            single_master_channel_endpoint_configuration: EndpointConfiguration {
                protocols: &[Protocol::Wss, Protocol::Https],
                role: ChannelRole::Viewer,
            },
        };
        let value = serde_json::to_value(&request).expect("serialize");
        assert_eq!(
            value,
            serde_json::json!({
                "ChannelARN": "arn:aws:kinesisvideo:us-east-1:1:channel/demo/1",
                "SingleMasterChannelEndpointConfiguration": {
                    "Protocols": ["WSS", "HTTPS"],
                    "Role": "VIEWER"
                }
            })
        );
    }

    #[test]
    fn ice_config_request_omits_missing_client_id() {
        let request = GetIceServerConfigRequest {
            channel_arn: "arn",
            client_id: None,
            service: "TURN",
        };
        let value = serde_json::to_value(&request).expect("serialize");
        assert_eq!(value, serde_json::json!({ "ChannelARN": "arn", "Service": "TURN" }));
    }

    #[test]
    fn default_endpoint_follows_partition() {
        assert_eq!(
            KinesisVideoClient::default_endpoint("eu-west-1")
                .expect("url")
                .as_str(),
            "https://kinesisvideo.eu-west-1.amazonaws.com/"
        );
        assert_eq!(
            KinesisVideoClient::default_endpoint("cn-north-1")
                .expect("url")
                .as_str(),
            "https://kinesisvideo.cn-north-1.amazonaws.com.cn/"
        );
    }

    #[test]
    fn join_path_tolerates_trailing_slash() {
        let joined = join_path("https://r-1.example.com/", "v1/get-ice-server-config").expect("url");
        assert_eq!(joined.as_str(), "https://r-1.example.com/v1/get-ice-server-config");
    }
}
