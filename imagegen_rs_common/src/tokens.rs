use std::{env, fmt, fs, path::PathBuf, str::FromStr};

use hf_hub::api::sync::ApiBuilder;
use thiserror::Error;
use tracing::warn;

const DEFAULT_TOKEN_VAR: &str = "HF_TOKEN";

/// Where the Hugging Face access token comes from.
///
/// Parsed from `literal:<token>`, `env[:<var>]`, `path:<file>`, `cache` or `none`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenSource {
    Literal(String),
    EnvVar(String),
    Path(PathBuf),
    /// The token saved by `huggingface-cli login`, looked up by hf-hub itself.
    HubCache,
    None,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenSourceError {
    #[error("token source `{0}` needs a value, as in `{0}:<value>`")]
    MissingValue(&'static str),
    #[error(
        "unknown token source `{0}`, \
         expected literal:<token>, env[:<var>], path:<file>, cache or none"
    )]
    Unknown(String),
}

impl FromStr for TokenSource {
    type Err = TokenSourceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, value) = match s.split_once(':') {
            Some((kind, value)) => (kind, Some(value).filter(|v| !v.is_empty())),
            None => (s, None),
        };
        match (kind, value) {
            ("literal", Some(token)) => Ok(Self::Literal(token.to_string())),
            ("literal", None) => Err(TokenSourceError::MissingValue("literal")),
            ("env", var) => Ok(Self::EnvVar(var.unwrap_or(DEFAULT_TOKEN_VAR).to_string())),
            ("path", Some(path)) => Ok(Self::Path(PathBuf::from(path))),
            ("path", None) => Err(TokenSourceError::MissingValue("path")),
            ("cache", None) => Ok(Self::HubCache),
            ("none", None) => Ok(Self::None),
            _ => Err(TokenSourceError::Unknown(s.to_string())),
        }
    }
}

impl fmt::Display for TokenSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Literal(_) => write!(f, "literal:<redacted>"),
            Self::EnvVar(var) => write!(f, "env:{var}"),
            Self::Path(path) => write!(f, "path:{}", path.display()),
            Self::HubCache => write!(f, "cache"),
            Self::None => write!(f, "none"),
        }
    }
}

impl TokenSource {
    /// The token named explicitly by this source.
    ///
    /// An unset variable or unreadable file is logged and yields no token, so public checkpoints
    /// still load. `HubCache` and `None` never yield one here.
    pub fn explicit_token(&self) -> Option<String> {
        let token = match self {
            Self::Literal(token) => Some(token.clone()),
            Self::EnvVar(var) => env::var(var)
                .inspect_err(|_| {
                    warn!("environment variable `{var}` is not set, using no HF token")
                })
                .ok(),
            Self::Path(path) => fs::read_to_string(path)
                .inspect_err(|e| {
                    warn!("cannot read HF token from `{}` ({e}), using no HF token", path.display())
                })
                .ok(),
            Self::HubCache | Self::None => None,
        };
        token
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
    }

    /// Configure the token of an hf-hub client.
    pub fn apply(&self, builder: ApiBuilder) -> ApiBuilder {
        match self {
            // `ApiBuilder::new` already read the cached login token.
            Self::HubCache => builder,
            _ => builder.with_token(self.explicit_token()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_token_sources() {
        assert_eq!(
            "literal:abc".parse::<TokenSource>(),
            Ok(TokenSource::Literal("abc".to_string()))
        );
        assert_eq!(
            "env".parse::<TokenSource>(),
            Ok(TokenSource::EnvVar("HF_TOKEN".to_string()))
        );
        assert_eq!(
            "env:MY_TOKEN".parse::<TokenSource>(),
            Ok(TokenSource::EnvVar("MY_TOKEN".to_string()))
        );
        assert_eq!(
            "path:/tmp/tok".parse::<TokenSource>(),
            Ok(TokenSource::Path(PathBuf::from("/tmp/tok")))
        );
        assert_eq!("cache".parse::<TokenSource>(), Ok(TokenSource::HubCache));
        assert_eq!("none".parse::<TokenSource>(), Ok(TokenSource::None));
    }

    #[test]
    fn rejects_incomplete_sources() {
        assert_eq!(
            "literal".parse::<TokenSource>(),
            Err(TokenSourceError::MissingValue("literal"))
        );
        assert_eq!(
            "path:".parse::<TokenSource>(),
            Err(TokenSourceError::MissingValue("path"))
        );
        assert!(matches!(
            "cache:x".parse::<TokenSource>(),
            Err(TokenSourceError::Unknown(_))
        ));
        assert!(matches!(
            "bogus".parse::<TokenSource>(),
            Err(TokenSourceError::Unknown(_))
        ));
    }

    #[test]
    fn literal_token_is_not_displayed() {
        let source = TokenSource::Literal("hf_secret".to_string());
        assert!(!source.to_string().contains("hf_secret"));
        assert_eq!(source.explicit_token().as_deref(), Some("hf_secret"));
    }

    #[test]
    fn reads_token_from_file_and_trims() -> std::io::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("token");
        fs::write(&path, "hf_abc\n")?;
        assert_eq!(
            TokenSource::Path(path).explicit_token().as_deref(),
            Some("hf_abc")
        );

        let blank = dir.path().join("blank");
        fs::write(&blank, "\n")?;
        assert_eq!(TokenSource::Path(blank).explicit_token(), None);
        Ok(())
    }

    #[test]
    fn unavailable_tokens_mean_no_token() {
        assert_eq!(
            TokenSource::Path(PathBuf::from("/nonexistent/token")).explicit_token(),
            None
        );
        assert_eq!(
            TokenSource::EnvVar("IMAGEGEN_RS_UNSET_TOKEN_VAR".to_string()).explicit_token(),
            None
        );
        assert_eq!(TokenSource::HubCache.explicit_token(), None);
        assert_eq!(TokenSource::None.explicit_token(), None);
    }
}
