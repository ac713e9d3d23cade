//! Hierarchical test tree
//!
//! Each node has a description, sequential steps, concurrent assertions and
//! children. A leaf path names the descriptions from (but excluding) the root
//! down to a childless node; the root acts as the suite container.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Key/value state threaded from step to step within one lane
pub type Context = Map<String, Value>;

/// A node of the test tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestNode {
    pub description: String,

    #[serde(default)]
    pub steps: Vec<Step>,

    #[serde(default)]
    pub assertions: Vec<Assertion>,

    #[serde(default)]
    pub children: Vec<TestNode>,
}

/// A step: runs in order, may contribute to the context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub description: String,

    #[serde(flatten)]
    pub action: StepAction,
}

/// What a step does
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum StepAction {
    /// Merge values into the context
    Set { values: Map<String, Value> },

    /// Wait a fixed amount of time
    Sleep { ms: u64 },

    /// Fail with a message
    Fail { message: String },

    /// Run a program; a non-zero exit fails the step
    Exec {
        program: String,
        #[serde(default)]
        args: Vec<String>,
        /// Store trimmed stdout under this context key
        #[serde(default)]
        capture: Option<String>,
    },
}

/// An assertion: checks run concurrently once every step succeeded
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assertion {
    pub description: String,

    #[serde(flatten)]
    pub check: Check,
}

/// What an assertion checks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "check", rename_all = "snake_case")]
pub enum Check {
    /// Context value at `key` equals `value`
    Equals { key: String, value: Value },

    /// Context has a non-null value at `key`
    Present { key: String },

    /// Passes after waiting
    Sleep { ms: u64 },

    /// Always fails
    Fail { message: String },

    /// Program exits successfully
    Exec {
        program: String,
        #[serde(default)]
        args: Vec<String>,
    },
}

impl TestNode {
    /// Create an empty node
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            steps: Vec::new(),
            assertions: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn with_step(mut self, description: impl Into<String>, action: StepAction) -> Self {
        self.steps.push(Step {
            description: description.into(),
            action,
        });
        self
    }

    pub fn with_assertion(mut self, description: impl Into<String>, check: Check) -> Self {
        self.assertions.push(Assertion {
            description: description.into(),
            check,
        });
        self
    }

    pub fn with_child(mut self, child: TestNode) -> Self {
        self.children.push(child);
        self
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// The child whose description equals `description`
    pub fn child(&self, description: &str) -> Option<&TestNode> {
        self.children.iter().find(|c| c.description == description)
    }

    /// Every leaf path under this node, depth first.
    ///
    /// A root without children is a single lane with the empty path.
    pub fn leaf_paths(&self) -> Vec<Vec<String>> {
        if self.is_leaf() {
            return vec![Vec::new()];
        }
        let mut paths = Vec::new();
        for child in &self.children {
            collect_leaf_paths(child, &mut Vec::new(), &mut paths);
        }
        paths
    }
}

fn collect_leaf_paths(node: &TestNode, prefix: &mut Vec<String>, out: &mut Vec<Vec<String>>) {
    prefix.push(node.description.clone());
    if node.is_leaf() {
        out.push(prefix.clone());
    } else {
        for child in &node.children {
            collect_leaf_paths(child, prefix, out);
        }
    }
    prefix.pop();
}

/// Shallow merge of `partial` into `context`; later keys win.
pub fn merge_context(context: &mut Context, partial: Context) {
    for (key, value) in partial {
        context.insert(key, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_tree() -> TestNode {
        TestNode::new("root")
            .with_child(
                TestNode::new("signup")
                    .with_child(TestNode::new("with email"))
                    .with_child(TestNode::new("with phone").with_child(TestNode::new("sms"))),
            )
            .with_child(TestNode::new("login"))
    }

    #[test]
    fn test_leaf_paths_depth_first() {
        let paths = sample_tree().leaf_paths();
        assert_eq!(
            paths,
            vec![
                vec!["signup", "with email"],
                vec!["signup", "with phone", "sms"],
                vec!["login"],
            ]
        );
    }

    #[test]
    fn test_childless_root_is_single_lane() {
        assert_eq!(TestNode::new("only").leaf_paths(), vec![Vec::<String>::new()]);
    }

    #[test]
    fn test_merge_context_is_shallow() {
        let mut context = Context::new();
        context.insert("user".into(), json!({"name": "alice", "age": 3}));
        context.insert("keep".into(), json!(true));

        let mut partial = Context::new();
        partial.insert("user".into(), json!({"name": "bob"}));
        merge_context(&mut context, partial);

        assert_eq!(context["user"], json!({"name": "bob"}));
        assert_eq!(context["keep"], json!(true));
    }

    #[test]
    fn test_parse_yaml_tree() {
        let yaml = r#"
description: checkout
steps:
  - description: seed cart
    action: set
    values:
      items: 2
assertions:
  - description: cart has items
    check: equals
    key: items
    value: 2
children:
  - description: pay by card
    steps:
      - description: run payment script
        action: exec
        program: ./pay.sh
        capture: receipt
"#;
        let tree: TestNode = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(tree.steps.len(), 1);
        assert!(matches!(tree.steps[0].action, StepAction::Set { .. }));
        assert_eq!(
            tree.assertions[0].check,
            Check::Equals {
                key: "items".into(),
                value: json!(2)
            }
        );
        let child = tree.child("pay by card").unwrap();
        match &child.steps[0].action {
            StepAction::Exec { program, args, capture } => {
                assert_eq!(program, "./pay.sh");
                assert!(args.is_empty());
                assert_eq!(capture.as_deref(), Some("receipt"));
            }
            other => panic!("unexpected action: {:?}", other),
        }
    }
}
