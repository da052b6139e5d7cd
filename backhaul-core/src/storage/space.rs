/*!
Managed cloud space location.

Sessions issued for the managed space name a bucket, a per-user prefix and a
region. Repositories live under `<prefix>/restic/` in that bucket.
*/

use super::{join_segments, RepositoryLocation};
use crate::config::AWS_DOMAIN;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpaceLocation {
    pub region: String,
    pub bucket: String,
    pub prefix: String,
}

impl SpaceLocation {
    pub fn new(
        region: impl Into<String>,
        bucket: impl Into<String>,
        prefix: impl Into<String>,
    ) -> Self {
        Self {
            region: region.into(),
            bucket: bucket.into(),
            prefix: prefix.into(),
        }
    }
}

impl RepositoryLocation for SpaceLocation {
    fn repository_url(&self, repo_name: &str) -> String {
        let path = join_segments([
            self.bucket.as_str(),
            self.prefix.as_str(),
            "restic",
            repo_name,
        ]);
        format!("s3:s3.{}.{}/{}", self.region, AWS_DOMAIN, path)
    }

    fn region(&self) -> Option<&str> {
        Some(&self.region)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_space_repository_url() {
        let location = SpaceLocation::new("us-east-1", "olares-space", "did:key:z6Mk/");
        assert_eq!(
            location.repository_url("photos"),
            "s3:s3.us-east-1.amazonaws.com/olares-space/did:key:z6Mk/restic/photos"
        );
        assert_eq!(location.region(), Some("us-east-1"));
    }

    #[test]
    fn test_space_without_prefix() {
        let location = SpaceLocation::new("ap-southeast-1", "bucket", "");
        assert_eq!(
            location.repository_url("docs"),
            "s3:s3.ap-southeast-1.amazonaws.com/bucket/restic/docs"
        );
    }
}
