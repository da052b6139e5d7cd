/*!
Self-managed AWS S3 location.

Endpoints are virtual-hosted bucket URLs,
`[https://]<bucket>.<region>.amazonaws.com[/<path prefix>]`.
*/

use std::str::FromStr;

use super::{invalid, trim_endpoint, RepositoryLocation};
use crate::config::AWS_DOMAIN;
use crate::{BackhaulError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3Endpoint {
    pub bucket: String,
    pub region: String,
    /// Empty, or ends with `/`
    pub prefix: String,
}

impl S3Endpoint {
    /// Parse a bucket endpoint
    ///
    /// # Arguments
    /// * `endpoint` - e.g. `https://backups.eu-west-1.amazonaws.com/team/`
    ///
    /// # Returns
    /// The parsed endpoint, or `InvalidEndpoint` when the host is not
    /// exactly `<bucket>.<region>.amazonaws.com`
    pub fn parse(endpoint: &str) -> Result<Self> {
        let trimmed = trim_endpoint(endpoint)?;
        let (host, path) = match trimmed.split_once('/') {
            Some((host, path)) => (host, path),
            None => (trimmed, ""),
        };

        let labels: Vec<&str> = host.splitn(3, '.').collect();
        let [bucket, region, domain] = labels.as_slice() else {
            return Err(invalid(endpoint));
        };
        if *domain != AWS_DOMAIN || bucket.is_empty() || region.is_empty() {
            return Err(invalid(endpoint));
        }

        Ok(Self {
            bucket: bucket.to_string(),
            region: region.to_string(),
            prefix: if path.is_empty() {
                String::new()
            } else {
                format!("{path}/")
            },
        })
    }
}

impl FromStr for S3Endpoint {
    type Err = BackhaulError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl RepositoryLocation for S3Endpoint {
    fn repository_url(&self, repo_name: &str) -> String {
        format!(
            "s3:s3.{}.{}/{}/{}{}",
            self.region, AWS_DOMAIN, self.bucket, self.prefix, repo_name
        )
    }

    fn region(&self) -> Option<&str> {
        Some(&self.region)
    }
}
