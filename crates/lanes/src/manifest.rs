//! Manifest loading
//!
//! A manifest is the loadable form of a test tree. The stock loader reads a
//! YAML or JSON file addressed by a `file://` URL or a plain path; other
//! bundler outputs plug in through [`ManifestLoader`].
//!
//! The root node is a suite container. When it has children, every lane
//! starts at one of them and the root's own steps and assertions would never
//! run, so such manifests are rejected. Put shared setup on the children.

use async_trait::async_trait;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use convoy_common::TestNode;

use crate::error::{LaneError, LaneResult};

/// Resolves a manifest URL to an executable test tree
#[async_trait]
pub trait ManifestLoader: Send + Sync {
    async fn load(&self, manifest_url: &str) -> LaneResult<TestNode>;
}

/// Loads YAML (`.yaml`, `.yml`) or JSON (`.json`) manifests from disk
#[derive(Debug, Clone, Copy, Default)]
pub struct FileManifestLoader;

impl FileManifestLoader {
    /// Map a manifest URL to a filesystem path
    pub fn resolve(manifest_url: &str) -> LaneResult<PathBuf> {
        if let Some(path) = manifest_url.strip_prefix("file://") {
            return Ok(PathBuf::from(path));
        }
        if let Some((scheme, _)) = manifest_url.split_once("://") {
            return Err(LaneError::Manifest(format!(
                "unsupported manifest scheme '{}' in {}",
                scheme, manifest_url
            )));
        }
        Ok(PathBuf::from(manifest_url))
    }

    /// Parse manifest content, choosing the format from the file extension
    pub fn parse(content: &str, path: &Path) -> LaneResult<TestNode> {
        let tree: TestNode = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(content)?,
            _ => serde_yaml::from_str(content)?,
        };
        validate_root(&tree)?;
        validate(&tree)?;
        Ok(tree)
    }
}

#[async_trait]
impl ManifestLoader for FileManifestLoader {
    async fn load(&self, manifest_url: &str) -> LaneResult<TestNode> {
        let path = Self::resolve(manifest_url)?;
        let content = tokio::fs::read_to_string(&path).await.map_err(|e| {
            LaneError::Manifest(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::parse(&content, &path)
    }
}

/// Reject a root that has children and also carries steps or assertions.
pub fn validate_root(root: &TestNode) -> LaneResult<()> {
    if !root.is_leaf() && (!root.steps.is_empty() || !root.assertions.is_empty()) {
        return Err(LaneError::Manifest(format!(
            "root '{}' has children, so its {} step(s) and {} assertion(s) would never run",
            root.description,
            root.steps.len(),
            root.assertions.len()
        )));
    }
    Ok(())
}

/// Reject trees whose paths would be ambiguous: sibling descriptions must be
/// unique, since a lane finds its way down by description.
pub fn validate(node: &TestNode) -> LaneResult<()> {
    let mut seen = HashSet::new();
    for child in &node.children {
        if !seen.insert(child.description.as_str()) {
            return Err(LaneError::Manifest(format!(
                "duplicate child '{}' under '{}'",
                child.description, node.description
            )));
        }
        validate(child)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_resolve_urls() {
        assert_eq!(
            FileManifestLoader::resolve("file:///tmp/suite.yaml").unwrap(),
            PathBuf::from("/tmp/suite.yaml")
        );
        assert_eq!(
            FileManifestLoader::resolve("suite.json").unwrap(),
            PathBuf::from("suite.json")
        );
        assert!(matches!(
            FileManifestLoader::resolve("http://bundler/manifest.js"),
            Err(LaneError::Manifest(_))
        ));
    }

    #[test]
    fn test_duplicate_siblings_rejected() {
        let tree = TestNode::new("root")
            .with_child(TestNode::new("same"))
            .with_child(TestNode::new("same"));
        assert!(matches!(validate(&tree), Err(LaneError::Manifest(_))));

        let nested = TestNode::new("root")
            .with_child(TestNode::new("a").with_child(TestNode::new("x")))
            .with_child(TestNode::new("b").with_child(TestNode::new("x")));
        assert!(validate(&nested).is_ok());
    }

    #[test]
    fn test_root_steps_with_children_rejected() {
        use convoy_common::StepAction;

        let content = r#"
description: suite
steps:
  - description: login
    action: set
    values: {user: admin}
children:
  - description: dashboard
"#;
        let err = FileManifestLoader::parse(content, Path::new("suite.yaml")).unwrap_err();
        assert!(err.to_string().contains("would never run"));

        // A childless root is itself the only lane, so its steps are fine.
        let single = TestNode::new("suite").with_step("wait", StepAction::Sleep { ms: 1 });
        assert!(validate_root(&single).is_ok());
    }

    #[tokio::test]
    async fn test_load_json_manifest() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(
            file,
            r#"{{"description":"root","children":[{{"description":"leaf","steps":[{{"description":"wait","action":"sleep","ms":5}}]}}]}}"#
        )
        .unwrap();

        let url = format!("file://{}", file.path().display());
        let tree = FileManifestLoader.load(&url).await.unwrap();
        assert_eq!(tree.leaf_paths(), vec![vec!["leaf".to_string()]]);
    }

    #[tokio::test]
    async fn test_missing_manifest() {
        let err = FileManifestLoader
            .load("/definitely/not/here.yaml")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("cannot read"));
    }
}
