use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use kvs_signaling::{
    ChannelIdentity, ChannelRole, Credentials, ResolverOptions, SigV4Signer, generate_client_id,
};
use url::Url;

use crate::error::{ViewerError, ViewerResult};
use crate::logging::{LogConfig, LogLevel};
use crate::peer::OfferOptions;

/// How remote candidates that arrive before the answer are handled.
#[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq)]
pub enum CandidatePolicy {
    /// Queue them and apply them in arrival order once the answer is set.
    #[default]
    BufferUntilAnswer,
    /// Hand every candidate to the peer connection as it arrives.
    Immediate,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum IceTransportPolicy {
    #[default]
    All,
    Relay,
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "kvs-viewer",
    about = "Join a Kinesis Video Streams signaling channel as a viewer"
)]
pub struct ViewerArgs {
    #[arg(long, env = "AWS_REGION")]
    pub region: String,

    #[arg(long, env = "AWS_ACCESS_KEY_ID")]
    pub access_key_id: String,

    #[arg(long, env = "AWS_SECRET_ACCESS_KEY", hide_env_values = true)]
    pub secret_access_key: String,

    #[arg(long, env = "AWS_SESSION_TOKEN", hide_env_values = true)]
    pub session_token: Option<String>,

    #[arg(long, env = "KVS_CHANNEL_NAME")]
    pub channel_name: Option<String>,

    #[arg(long, env = "KVS_CHANNEL_ARN")]
    pub channel_arn: Option<String>,

    #[arg(long, env = "KVS_ENDPOINT", help = "Control-plane endpoint override")]
    pub endpoint: Option<String>,

    #[arg(long, env = "KVS_CLIENT_ID", help = "Viewer client id (random when unset)")]
    pub client_id: Option<String>,

    #[arg(
        long,
        env = "KVS_CANDIDATE_POLICY",
        value_enum,
        default_value_t = CandidatePolicy::BufferUntilAnswer
    )]
    pub candidate_policy: CandidatePolicy,

    #[arg(long, help = "Only use relay (TURN) candidates")]
    pub relay_only: bool,

    #[arg(long, help = "Skip the TURN credential lookup and use STUN only")]
    pub disable_turn: bool,

    #[arg(long, env = "KVS_STATS_INTERVAL_SECS")]
    pub stats_interval_secs: Option<u64>,

    #[arg(
        long,
        env = "KVS_CLOCK_OFFSET_SECS",
        allow_hyphen_values = true,
        default_value_t = 0
    )]
    pub clock_offset_secs: i64,

    #[arg(long, value_enum, default_value_t = LogLevel::Info)]
    pub log_level: LogLevel,

    #[arg(long, help = "Append logs to this file instead of stderr")]
    pub log_file: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ViewerConfig {
    pub region: String,
    pub credentials: Credentials,
    pub channel: ChannelIdentity,
    pub endpoint: Option<Url>,
    pub client_id: String,
    pub candidate_policy: CandidatePolicy,
    pub ice_transport_policy: IceTransportPolicy,
    pub fetch_turn: bool,
    pub stats_interval: Option<Duration>,
    pub clock_offset: time::Duration,
    pub log: LogConfig,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn required(value: String, what: &str) -> ViewerResult<String> {
    non_empty(Some(value)).ok_or_else(|| ViewerError::Config(format!("{what} must not be empty")))
}

impl ViewerArgs {
    pub fn into_config(self) -> ViewerResult<ViewerConfig> {
        let region = required(self.region, "region")?;
        let credentials = Credentials::new(
            required(self.access_key_id, "access key id")?,
            required(self.secret_access_key, "secret access key")?,
        )
        .with_session_token(non_empty(self.session_token));

        let channel = match (non_empty(self.channel_name), non_empty(self.channel_arn)) {
            (Some(name), None) => ChannelIdentity::Name(name),
            (None, Some(arn)) => ChannelIdentity::Arn(arn),
            (Some(_), Some(_)) => {
                return Err(ViewerError::Config(
                    "pass either a channel name or a channel ARN, not both".into(),
                ));
            }
            (None, None) => {
                return Err(ViewerError::Config(
                    "a channel name or channel ARN is required".into(),
                ));
            }
        };

        let endpoint = non_empty(self.endpoint)
            .map(|raw| {
                Url::parse(&raw)
                    .map_err(|err| ViewerError::Config(format!("invalid endpoint {raw}: {err}")))
            })
            .transpose()?;

        let stats_interval = match self.stats_interval_secs {
            Some(0) => {
                return Err(ViewerError::Config(
                    "stats interval must be at least one second".into(),
                ));
            }
            Some(secs) => Some(Duration::from_secs(secs)),
            None => None,
        };

        Ok(ViewerConfig {
            region,
            credentials,
            channel,
            endpoint,
            client_id: non_empty(self.client_id).unwrap_or_else(generate_client_id),
            candidate_policy: self.candidate_policy,
            ice_transport_policy: if self.relay_only {
                IceTransportPolicy::Relay
            } else {
                IceTransportPolicy::All
            },
            fetch_turn: !self.disable_turn,
            stats_interval,
            clock_offset: time::Duration::seconds(self.clock_offset_secs),
            log: LogConfig {
                level: self.log_level,
                file: self.log_file,
            },
        })
    }
}

impl ViewerConfig {
    pub fn signer(&self) -> SigV4Signer {
        SigV4Signer::new(self.credentials.clone(), self.region.clone())
            .with_clock_offset(self.clock_offset)
    }

    pub fn resolver_options(&self) -> ResolverOptions {
        ResolverOptions {
            role: ChannelRole::Viewer,
            client_id: Some(self.client_id.clone()),
            fetch_turn: self.fetch_turn,
        }
    }

    pub fn session_options(&self) -> crate::session::SessionOptions {
        crate::session::SessionOptions {
            candidate_policy: self.candidate_policy,
            stats_interval: self.stats_interval,
            offer: OfferOptions::default(),
        }
    }
}
