//! Request-line dispatch
//!
//! A request is a JSON array of strings whose first element names the
//! command (case-insensitive):
//!
//! ```text
//!   ["PULL", FORMAT_SPEC_JSON, SCHEMA_PATH, BUCKET, KEY...]
//!   ["REFRESH", BUCKET]
//!   ["LIST", BUCKET, PREFIX?]
//!   ["GLOB", BUCKET, PATTERN]
//!   ["STATUS"]
//! ```
//!
//! Replies are `OK\n` followed by one result per line, or `ERROR\n`
//! followed by the message.

use crate::error::{PoolError, Result};
use crate::pool::Pool;
use std::fmt;
use std::path::PathBuf;
use std::time::Instant;
use tracing::info;

/// A parsed request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Pull {
        format_spec: String,
        schema: PathBuf,
        bucket: String,
        keys: Vec<String>,
    },
    Refresh {
        bucket: String,
    },
    List {
        bucket: String,
        prefix: String,
    },
    Glob {
        bucket: String,
        pattern: String,
    },
    Status,
}

impl Request {
    /// Parse one request line
    pub fn parse(line: &str) -> Result<Self> {
        let args: Vec<String> = serde_json::from_str(line)
            .map_err(|_| PoolError::InvalidRequest("Invalid JSON in request".into()))?;
        let (command, args) = match args.split_first() {
            Some((command, rest)) => (command.to_uppercase(), rest),
            None => (String::new(), &args[..]),
        };

        let invalid = |reason: &str| PoolError::InvalidArguments {
            command: command.clone(),
            reason: reason.to_string(),
        };

        match command.as_str() {
            "PULL" => match args {
                [format_spec, schema, bucket, keys @ ..] if !keys.is_empty() => Ok(Request::Pull {
                    format_spec: format_spec.clone(),
                    schema: PathBuf::from(schema),
                    bucket: bucket.clone(),
                    keys: keys.to_vec(),
                }),
                _ => Err(invalid("expected at least 4 arguments")),
            },
            "REFRESH" => match args {
                [bucket] => Ok(Request::Refresh {
                    bucket: bucket.clone(),
                }),
                _ => Err(invalid("expected 1 argument")),
            },
            "LIST" => match args {
                [bucket] => Ok(Request::List {
                    bucket: bucket.clone(),
                    prefix: String::new(),
                }),
                [bucket, prefix] => Ok(Request::List {
                    bucket: bucket.clone(),
                    prefix: prefix.clone(),
                }),
                _ => Err(invalid("expected 1 or 2 arguments")),
            },
            "GLOB" => match args {
                [bucket, pattern] => Ok(Request::Glob {
                    bucket: bucket.clone(),
                    pattern: pattern.clone(),
                }),
                _ => Err(invalid("expected 2 arguments")),
            },
            "STATUS" => Ok(Request::Status),
            _ => Err(PoolError::InvalidRequest(format!("Bad command: {}", command))),
        }
    }

    /// Command name for logging
    pub fn command(&self) -> &'static str {
        match self {
            Request::Pull { .. } => "PULL",
            Request::Refresh { .. } => "REFRESH",
            Request::List { .. } => "LIST",
            Request::Glob { .. } => "GLOB",
            Request::Status => "STATUS",
        }
    }

    /// Run against `pool`, producing the reply body
    pub fn execute(&self, pool: &Pool) -> Result<String> {
        let body = match self {
            Request::Pull {
                format_spec,
                schema,
                bucket,
                keys,
            } => lines(
                pool.pull(format_spec, schema, bucket, keys)?
                    .iter()
                    .map(|p| p.display().to_string()),
            ),
            Request::Refresh { bucket } => {
                pool.refresh(bucket)?;
                "\n".to_string()
            }
            Request::List { bucket, prefix } => lines(
                pool.list(bucket, prefix)?
                    .into_iter()
                    .map(|(key, etag)| format!("{} {}", etag, key)),
            ),
            Request::Glob { bucket, pattern } => lines(pool.glob(bucket, pattern)?),
            Request::Status => lines(
                pool.status()
                    .into_iter()
                    .map(|(name, value)| format!("{} {}", name, value)),
            ),
        };
        Ok(body)
    }
}

fn lines<I, S>(items: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out = String::new();
    for item in items {
        out.push_str(item.as_ref());
        out.push('\n');
    }
    out
}

/// Reply to one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Ok(String),
    Error(String),
}

impl Reply {
    pub fn is_ok(&self) -> bool {
        matches!(self, Reply::Ok(_))
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Ok(body) => write!(f, "OK\n{}", body),
            Reply::Error(message) => write!(f, "ERROR\n{}", message),
        }
    }
}

/// Parse, execute and log one request line
pub fn dispatch(pool: &Pool, line: &str) -> Reply {
    let started = Instant::now();
    let result = Request::parse(line).and_then(|request| request.execute(pool));
    let reply = match result {
        Ok(body) => Reply::Ok(body),
        Err(e) => Reply::Error(e.to_string()),
    };

    let elapsed_ms = started.elapsed().as_millis() as u64;
    match &reply {
        Reply::Ok(body) => info!(request = line, bytes = body.len(), elapsed_ms, "OK"),
        Reply::Error(message) => info!(request = line, error = %message, elapsed_ms, "ERROR"),
    }
    reply
}
