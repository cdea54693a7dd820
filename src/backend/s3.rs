//! Object storage backend driven by the aws cli
//!
//! ```text
//! aws s3api get-object --bucket BUCKET --key KEY DEST
//! aws s3api list-objects-v2 --bucket BUCKET --prefix PREFIX --output json
//! ```

use super::{looks_not_found, Backend, BackendKind};
use crate::error::{BackendError, BackendResult};
use crate::tool::{Tool, ToolFailure};
use serde::Deserialize;
use std::ffi::OsStr;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Deserialize)]
struct GetObjectReply {
    #[serde(rename = "ETag", default)]
    etag: String,
}

#[derive(Debug, Deserialize)]
struct ListRecord {
    #[serde(rename = "Key")]
    key: String,
    #[serde(rename = "ETag", default)]
    etag: String,
}

#[derive(Debug, Default, Deserialize)]
struct ListCollection {
    #[serde(rename = "Contents", default)]
    contents: Vec<ListRecord>,
}

/// S3 via `aws s3api`
#[derive(Debug, Clone)]
pub struct S3Backend {
    aws: Tool,
}

impl S3Backend {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            aws: Tool::new("aws").with_timeout(timeout),
        }
    }

    fn classify(&self, bucket: &str, key: &str, failure: ToolFailure) -> BackendError {
        match &failure {
            ToolFailure::Exit { stderr, .. } if looks_not_found(stderr) => BackendError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            },
            _ => failure.into(),
        }
    }
}

impl Backend for S3Backend {
    fn kind(&self) -> BackendKind {
        BackendKind::S3
    }

    fn source_uri(&self, bucket: &str, key: &str) -> String {
        format!("s3://{}/{}", bucket, key)
    }

    fn fetch(&self, bucket: &str, key: &str, dest: &Path) -> BackendResult<String> {
        let args: [&OsStr; 7] = [
            OsStr::new("s3api"),
            OsStr::new("get-object"),
            OsStr::new("--bucket"),
            OsStr::new(bucket),
            OsStr::new("--key"),
            OsStr::new(key),
            dest.as_os_str(),
        ];
        let output = self
            .aws
            .run(args)
            .map_err(|failure| self.classify(bucket, key, failure))?;

        parse_get_object_etag(&output.stdout_str())
    }

    fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        notify: &mut dyn FnMut(&str, &str),
    ) -> BackendResult<()> {
        let output = self.aws.run([
            "s3api",
            "list-objects-v2",
            "--bucket",
            bucket,
            "--prefix",
            prefix,
            "--output",
            "json",
        ])?;

        for record in parse_list_objects(&output.stdout_str())? {
            notify(&record.key, &record.etag);
        }
        Ok(())
    }

    fn required_tools(&self) -> Vec<(Tool, &'static [&'static str])> {
        vec![(self.aws.clone(), &["--version"][..])]
    }
}

/// Strip the quotes S3 wraps around etags
fn unquote(etag: &str) -> String {
    etag.trim().trim_matches('"').to_string()
}

fn parse_get_object_etag(stdout: &str) -> BackendResult<String> {
    let reply: GetObjectReply = serde_json::from_str(stdout).map_err(|e| BackendError::Parse {
        tool: "aws s3api get-object".into(),
        reason: e.to_string(),
    })?;
    Ok(unquote(&reply.etag))
}

fn parse_list_objects(stdout: &str) -> BackendResult<Vec<ListRecord>> {
    // An empty bucket prints nothing at all
    if stdout.trim().is_empty() {
        return Ok(Vec::new());
    }
    let collection: ListCollection =
        serde_json::from_str(stdout).map_err(|e| BackendError::Parse {
            tool: "aws s3api list-objects-v2".into(),
            reason: e.to_string(),
        })?;

    Ok(collection
        .contents
        .into_iter()
        .map(|r| ListRecord {
            etag: unquote(&r.etag),
            key: r.key,
        })
        .collect())
}
