use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum GatewayError {
    #[snafu(display("gateway id '{raw}' is invalid for {id_type}"))]
    InvalidId {
        stage: &'static str,
        id_type: &'static str,
        raw: String,
    },
    #[snafu(display("gateway endpoint '{endpoint}' is not an http(s) URL"))]
    InvalidEndpoint {
        stage: &'static str,
        endpoint: String,
    },
    #[snafu(display("http transport failed on `{stage}`, {source}"))]
    Http {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("gateway returned status {status} on `{stage}`: {message}"))]
    Status {
        stage: &'static str,
        status: u16,
        message: String,
    },
    #[snafu(display("failed to decode gateway payload on `{stage}`: {source}"))]
    Decode {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("gateway rejected `{stage}`: {reason}"))]
    Rejected { stage: &'static str, reason: String },
    #[snafu(display("push channel is closed"))]
    PushClosed { stage: &'static str },
}

impl GatewayError {
    /// HTTP-like status code carried by the failure, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            Self::Http { source, .. } => source.status().map(|status| status.as_u16()),
            _ => None,
        }
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;
