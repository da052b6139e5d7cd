/*!
Self-managed Tencent COS location.

Endpoints are path-style, `[https://]cos.<region>.myqcloud.com/<bucket>[/<path prefix>]`,
and the engine talks to them through its S3 backend over https.
*/

use std::str::FromStr;

use super::{invalid, trim_endpoint, RepositoryLocation};
use crate::config::TENCENT_DOMAIN;
use crate::{BackhaulError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CosEndpoint {
    pub region: String,
    pub bucket: String,
    /// Empty, or ends with `/`
    pub prefix: String,
}

impl CosEndpoint {
    pub fn parse(endpoint: &str) -> Result<Self> {
        let trimmed = trim_endpoint(endpoint)?;
        let parts: Vec<&str> = trimmed.split('/').collect();
        let [host, bucket, rest @ ..] = parts.as_slice() else {
            return Err(invalid(endpoint));
        };
        if bucket.is_empty() {
            return Err(invalid(endpoint));
        }

        let labels: Vec<&str> = host.splitn(3, '.').collect();
        let ["cos", region, domain] = labels.as_slice() else {
            return Err(invalid(endpoint));
        };
        if *domain != TENCENT_DOMAIN || region.is_empty() {
            return Err(invalid(endpoint));
        }

        Ok(Self {
            region: region.to_string(),
            bucket: bucket.to_string(),
            prefix: if rest.is_empty() {
                String::new()
            } else {
                format!("{}/", rest.join("/"))
            },
        })
    }
}

impl FromStr for CosEndpoint {
    type Err = BackhaulError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl RepositoryLocation for CosEndpoint {
    fn repository_url(&self, repo_name: &str) -> String {
        format!(
            "s3:https://cos.{}.{}/{}/{}{}",
            self.region, TENCENT_DOMAIN, self.bucket, self.prefix, repo_name
        )
    }

    fn region(&self) -> Option<&str> {
        Some(&self.region)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cos_endpoint() {
        let endpoint = CosEndpoint::parse("https://cos.ap-beijing.myqcloud.com/backups-1250000000/").unwrap();
        assert_eq!(endpoint.region, "ap-beijing");
        assert_eq!(endpoint.bucket, "backups-1250000000");
        assert_eq!(
            endpoint.repository_url("photos"),
            "s3:https://cos.ap-beijing.myqcloud.com/backups-1250000000/photos"
        );
    }

    #[test]
    fn test_parse_cos_with_prefix() {
        let endpoint = CosEndpoint::parse("cos.ap-guangzhou.myqcloud.com/bkt/a/b").unwrap();
        assert_eq!(
            endpoint.repository_url("docs"),
            "s3:https://cos.ap-guangzhou.myqcloud.com/bkt/a/b/docs"
        );
    }

    #[test]
    fn test_rejects_malformed_cos_endpoints() {
        for endpoint in [
            "",
            "cos.ap-beijing.myqcloud.com",
            "oss.ap-beijing.myqcloud.com/bucket",
            "cos.ap-beijing.aliyuncs.com/bucket",
            "cos.myqcloud.com/bucket",
            "backups.us-east-1.amazonaws.com/path",
        ] {
            assert!(
                matches!(CosEndpoint::parse(endpoint), Err(BackhaulError::InvalidEndpoint(_))),
                "accepted {endpoint:?}"
            );
        }
    }
}
