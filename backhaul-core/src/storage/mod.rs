/*!
Repository addressing for each storage backend.

The engine reaches every backend through a single repository string
(`RESTIC_REPOSITORY`). This module turns backend configuration and session
fields into that string. Each backend is a [`RepositoryLocation`]; parsing a
location validates the endpoint up front, so a malformed endpoint fails with
[`BackhaulError::InvalidEndpoint`] and never yields a partial address.
*/

pub mod cos;
pub mod local;
pub mod s3;
pub mod space;

pub use cos::CosEndpoint;
pub use local::LocalLocation;
pub use s3::S3Endpoint;
pub use space::SpaceLocation;

use crate::{BackhaulError, Result};

/// A parsed backend location that can address a named repository
pub trait RepositoryLocation {
    /// Repository string handed to the engine
    ///
    /// # Arguments
    /// * `repo_name` - The logical repository name
    fn repository_url(&self, repo_name: &str) -> String;

    /// Region the location lives in, when the backend has one
    fn region(&self) -> Option<&str> {
        None
    }
}

/// Strip the scheme and trailing slashes from a bucket endpoint
fn trim_endpoint(endpoint: &str) -> Result<&str> {
    if endpoint.is_empty() {
        return Err(BackhaulError::invalid_endpoint("endpoint is empty"));
    }
    let trimmed = endpoint
        .strip_prefix("https://")
        .unwrap_or(endpoint)
        .trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(invalid(endpoint));
    }
    Ok(trimmed)
}

fn invalid(endpoint: &str) -> BackhaulError {
    BackhaulError::invalid_endpoint(format!("endpoint {endpoint:?} is invalid"))
}

/// `a/b/` + `c` with exactly one slash between non-empty segments
fn join_segments<'a>(segments: impl IntoIterator<Item = &'a str>) -> String {
    segments
        .into_iter()
        .flat_map(|segment| segment.split('/'))
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trim_endpoint() {
        assert_eq!(
            trim_endpoint("https://bucket.us-west-2.amazonaws.com/").unwrap(),
            "bucket.us-west-2.amazonaws.com"
        );
        assert!(matches!(
            trim_endpoint(""),
            Err(BackhaulError::InvalidEndpoint(msg)) if msg == "endpoint is empty"
        ));
        assert!(trim_endpoint("https:///").is_err());
    }

    #[test]
    fn test_join_segments() {
        assert_eq!(join_segments(["tenant/", "/restic", "photos"]), "tenant/restic/photos");
        assert_eq!(join_segments(["", "restic", "photos"]), "restic/photos");
    }
}
