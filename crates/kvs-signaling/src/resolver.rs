use std::collections::BTreeMap;

use serde::Serialize;
use tracing::{debug, info};

use crate::api::{ChannelApi, ChannelRole, Protocol, ResourceEndpoint, dns_suffix};
use crate::error::{SignalingError, SignalingResult};

const ACTIVE_STATUS: &str = "ACTIVE";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelIdentity {
    Name(String),
    Arn(String),
}

impl ChannelIdentity {
    pub fn describe(&self) -> &str {
        match self {
            ChannelIdentity::Name(name) => name,
            ChannelIdentity::Arn(arn) => arn,
        }
    }
}

/// Endpoints keyed by protocol label. Always holds both `WSS` and `HTTPS`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointSet {
    endpoints: BTreeMap<String, String>,
}

impl EndpointSet {
    /// Later entries for the same protocol replace earlier ones.
    pub fn from_resource_endpoints(list: Vec<ResourceEndpoint>) -> SignalingResult<Self> {
        let endpoints: BTreeMap<String, String> = list
            .into_iter()
            .map(|endpoint| (endpoint.protocol, endpoint.resource_endpoint))
            .collect();
        for protocol in [Protocol::Wss, Protocol::Https] {
            if !endpoints.contains_key(protocol.as_str()) {
                return Err(SignalingError::MissingEndpoint(protocol.as_str()));
            }
        }
        Ok(Self { endpoints })
    }

    pub fn get(&self, protocol: &str) -> Option<&str> {
        self.endpoints.get(protocol).map(String::as_str)
    }

    pub fn wss(&self) -> &str {
        self.get(Protocol::Wss.as_str()).unwrap_or_default()
    }

    pub fn https(&self) -> &str {
        self.get(Protocol::Https.as_str()).unwrap_or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.endpoints
            .iter()
            .map(|(protocol, url)| (protocol.as_str(), url.as_str()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(region: &str) -> Self {
        Self {
            urls: vec![stun_url(region)],
            username: None,
            credential: None,
        }
    }
}

pub fn stun_url(region: &str) -> String {
    format!("stun:stun.kinesisvideo.{region}.{}:443", dns_suffix(region))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedChannel {
    pub channel_arn: String,
    pub endpoints: EndpointSet,
    /// The regional STUN entry first, then the TURN entries in the order the
    /// service returned them.
    pub ice_servers: Vec<IceServer>,
}

#[derive(Debug, Clone)]
pub struct ResolverOptions {
    pub role: ChannelRole,
    pub client_id: Option<String>,
    pub fetch_turn: bool,
}

impl Default for ResolverOptions {
    fn default() -> Self {
        Self {
            role: ChannelRole::Viewer,
            client_id: None,
            fetch_turn: true,
        }
    }
}

pub struct ChannelResolver<A> {
    api: A,
    region: String,
    options: ResolverOptions,
}

impl<A: ChannelApi> ChannelResolver<A> {
    pub fn new(api: A, region: impl Into<String>) -> Self {
        Self {
            api,
            region: region.into(),
            options: ResolverOptions::default(),
        }
    }

    pub fn with_options(mut self, options: ResolverOptions) -> Self {
        self.options = options;
        self
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    /// Runs describe (names only), endpoint lookup and TURN lookup in
    /// sequence. The first failure aborts the whole resolution.
    pub async fn resolve(&self, identity: &ChannelIdentity) -> SignalingResult<ResolvedChannel> {
        let channel_arn = match identity {
            ChannelIdentity::Arn(arn) => arn.clone(),
            ChannelIdentity::Name(name) => {
                let info = self.api.describe_signaling_channel(name).await?;
                if let Some(status) = info.channel_status.as_deref() {
                    if status != ACTIVE_STATUS {
                        return Err(SignalingError::ChannelNotActive {
                            arn: info.channel_arn,
                            status: status.to_string(),
                        });
                    }
                }
                info.channel_arn
            }
        };
        info!(channel_arn = %channel_arn, "resolved signaling channel");

        let endpoints = self
            .api
            .get_signaling_channel_endpoint(
                &channel_arn,
                self.options.role,
                &[Protocol::Wss, Protocol::Https],
            )
            .await?;
        let endpoints = EndpointSet::from_resource_endpoints(endpoints)?;
        info!(wss = endpoints.wss(), https = endpoints.https(), "resolved endpoints");

        let mut ice_servers = vec![IceServer::stun(&self.region)];
        if self.options.fetch_turn {
            let turn = self
                .api
                .get_ice_server_config(
                    endpoints.https(),
                    &channel_arn,
                    self.options.client_id.as_deref(),
                )
                .await?;
            ice_servers.extend(turn.into_iter().map(|entry| IceServer {
                urls: entry.uris,
                username: entry.username,
                credential: entry.password,
            }));
        } else {
            debug!("turn lookup disabled, using stun only");
        }
        info!(count = ice_servers.len(), "resolved ice servers");

        Ok(ResolvedChannel {
            channel_arn,
            endpoints,
            ice_servers,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{ChannelInfo, IceServerConfig};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct ScriptedApi {
        status: Option<String>,
        endpoints: Vec<ResourceEndpoint>,
        turn: Vec<IceServerConfig>,
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ChannelApi for ScriptedApi {
        async fn describe_signaling_channel(
            &self,
            channel_name: &str,
        ) -> SignalingResult<ChannelInfo> {
            self.calls.lock().push(format!("describe:{channel_name}"));
            Ok(ChannelInfo {
                channel_arn: format!("arn:aws:kinesisvideo:cn-north-1:1:channel/{channel_name}/1"),
                channel_name: Some(channel_name.to_string()),
                channel_status: self.status.clone(),
                channel_type: Some("SINGLE_MASTER".into()),
            })
        }

        async fn get_signaling_channel_endpoint(
            &self,
            channel_arn: &str,
            role: ChannelRole,
            _protocols: &[Protocol],
        ) -> SignalingResult<Vec<ResourceEndpoint>> {
            self.calls.lock().push(format!("endpoint:{channel_arn}:{role:?}"));
            Ok(self.endpoints.clone())
        }

        async fn get_ice_server_config(
            &self,
            https_endpoint: &str,
            _channel_arn: &str,
            _client_id: Option<&str>,
        ) -> SignalingResult<Vec<IceServerConfig>> {
            self.calls.lock().push(format!("ice:{https_endpoint}"));
            Ok(self.turn.clone())
        }
    }

    fn both_endpoints() -> Vec<ResourceEndpoint> {
        vec![
            ResourceEndpoint {
                protocol: "WSS".into(),
                resource_endpoint: "wss://m-1.example".into(),
            },
            ResourceEndpoint {
                protocol: "HTTPS".into(),
                resource_endpoint: "https://r-1.example".into(),
            },
        ]
    }

    #[tokio::test]
    async fn china_regions_use_cn_stun_domain() {
        let api = ScriptedApi {
            endpoints: both_endpoints(),
            ..Default::default()
        };
        let resolver = ChannelResolver::new(api, "cn-north-1");
        let resolved = resolver
            .resolve(&ChannelIdentity::Name("demo".into()))
            .await
            .expect("resolve");
        assert_eq!(
            resolved.ice_servers[0].urls,
            vec!["stun:stun.kinesisvideo.cn-north-1.amazonaws.com.cn:443".to_string()]
        );
    }

    #[tokio::test]
    async fn turn_lookup_goes_to_https_endpoint_after_endpoint_lookup() {
        let api = ScriptedApi {
            endpoints: both_endpoints(),
            ..Default::default()
        };
        let resolver = ChannelResolver::new(api, "us-east-1");
        resolver
            .resolve(&ChannelIdentity::Name("demo".into()))
            .await
            .expect("resolve");
        let calls = resolver.api().calls.lock().clone();
        assert_eq!(
            calls,
            vec![
                "describe:demo".to_string(),
                "endpoint:arn:aws:kinesisvideo:cn-north-1:1:channel/demo/1:Viewer".to_string(),
                "ice:https://r-1.example".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn missing_status_is_treated_as_active() {
        let api = ScriptedApi {
            status: None,
            endpoints: both_endpoints(),
            ..Default::default()
        };
        let resolver = ChannelResolver::new(api, "us-east-1");
        assert!(resolver
            .resolve(&ChannelIdentity::Name("demo".into()))
            .await
            .is_ok());
    }

    #[test]
    fn duplicate_protocol_keeps_last_entry() {
        let mut list = both_endpoints();
        list.push(ResourceEndpoint {
            protocol: "WSS".into(),
            resource_endpoint: "wss://m-2.example".into(),
        });
        let set = EndpointSet::from_resource_endpoints(list).expect("set");
        assert_eq!(set.wss(), "wss://m-2.example");
        assert_eq!(set.iter().count(), 2);
    }

    #[test]
    fn endpoint_set_requires_https() {
        let list = vec![ResourceEndpoint {
            protocol: "WSS".into(),
            resource_endpoint: "wss://m-1.example".into(),
        }];
        assert!(matches!(
            EndpointSet::from_resource_endpoints(list),
            Err(SignalingError::MissingEndpoint("HTTPS"))
        ));
    }

    #[test]
    fn ice_server_serializes_like_rtc_configuration() {
        let server = IceServer {
            urls: vec!["turn:1.2.3.4:443?transport=udp".into()],
            username: Some("user".into()),
            credential: Some("pass".into()),
        };
        assert_eq!(
            serde_json::to_value(&server).expect("json"),
            serde_json::json!({
                "urls": ["turn:1.2.3.4:443?transport=udp"],
                "username": "user",
                "credential": "pass"
            })
        );
        assert_eq!(
            serde_json::to_value(IceServer::stun("us-east-1")).expect("json"),
            serde_json::json!({ "urls": ["stun:stun.kinesisvideo.us-east-1.amazonaws.com:443"] })
        );
    }
}
