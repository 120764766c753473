//! Bridged upstream products.
//!
//! A product binds a set of inbound paths and a locally-invented alias base (e.g.
//! `nano_banana_edit`) to static fallback candidate lists. Everything else about the bridge is
//! shared.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Logical operation named by an alias suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Submit,
    Status,
    Result,
}

impl Operation {
    pub const ALL: [Self; 3] = [Self::Submit, Self::Status, Self::Result];

    pub fn suffix(self) -> &'static str {
        match self {
            Self::Submit => "submit",
            Self::Status => "status",
            Self::Result => "result",
        }
    }

    /// Query parameter that forces the upstream tool name for this operation.
    pub fn override_param(self) -> &'static str {
        match self {
            Self::Submit => "tool_submit",
            Self::Status => "tool_status",
            Self::Result => "tool_result",
        }
    }
}

/// Shape of the synthetic `tools/list` answer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ToolSchemaKind {
    #[default]
    ImageEdit,
    Video,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FallbackCandidates {
    pub submit: Vec<String>,
    pub status: Vec<String>,
    pub result: Vec<String>,
}

impl FallbackCandidates {
    pub fn for_operation(&self, op: Operation) -> &[String] {
        match op {
            Operation::Submit => &self.submit,
            Operation::Status => &self.status,
            Operation::Result => &self.result,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeProduct {
    /// Human-readable name, used in logs.
    pub name: String,
    /// Alias base; inbound tool names end in `<alias>_<operation>`.
    pub alias: String,
    /// Inbound paths where `tools/call` is bridged (and `tools/list` is synthesized).
    pub paths: Vec<String>,
    /// Inbound paths where only `tools/list` is synthesized.
    #[serde(default)]
    pub synthetic_paths: Vec<String>,
    #[serde(default)]
    pub schema: ToolSchemaKind,
    pub fallbacks: FallbackCandidates,
}

impl BridgeProduct {
    /// Recognize the logical operation from an inbound tool name (case-insensitive suffix match).
    pub fn recognize(&self, tool_name: &str) -> Option<Operation> {
        let name = tool_name.to_ascii_lowercase();
        let alias = self.alias.to_ascii_lowercase();
        Operation::ALL
            .into_iter()
            .find(|op| name.ends_with(&format!("{alias}_{}", op.suffix())))
    }

    pub fn tool_name(&self, op: Operation) -> String {
        format!("{}_{}", self.alias, op.suffix())
    }
}

fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| (*s).to_string()).collect()
}

/// Products bridged when the config file does not replace the list.
pub fn builtin_products() -> Vec<BridgeProduct> {
    vec![
        BridgeProduct {
            name: "nano-banana".to_string(),
            alias: "nano_banana_edit".to_string(),
            paths: names(&["/mcp/i2i/fal/nano-banana/edit", "/mcp/i2i/fal/nano-banana"]),
            synthetic_paths: names(&["/mcp/t2i/fal/nano-banana"]),
            schema: ToolSchemaKind::ImageEdit,
            fallbacks: FallbackCandidates {
                submit: names(&[
                    "nano_banana_edit_submit",
                    "edit_submit",
                    "submit",
                    "run",
                    "process",
                ]),
                status: names(&["nano_banana_edit_status", "status", "get_status", "poll"]),
                result: names(&["nano_banana_edit_result", "result", "get_result", "get"]),
            },
        },
        BridgeProduct {
            name: "seedream".to_string(),
            alias: "seedream_edit".to_string(),
            paths: names(&[
                "/mcp/i2i/fal/bytedance/seedream/v4",
                "/mcp/i2i/fal/bytedance/seedream",
            ]),
            synthetic_paths: names(&["/mcp/t2i/fal/bytedance/seedream"]),
            schema: ToolSchemaKind::ImageEdit,
            fallbacks: FallbackCandidates {
                submit: names(&[
                    "bytedance_seedream_v4_edit_submit",
                    "seedream_submit",
                    "seedream_v4_submit",
                    "i2i_seedream_submit",
                    "seedream_edit",
                    "edit",
                    "submit",
                ]),
                status: names(&[
                    "bytedance_seedream_v4_edit_status",
                    "seedream_status",
                    "get_status",
                    "status",
                ]),
                result: names(&[
                    "bytedance_seedream_v4_edit_result",
                    "seedream_result",
                    "get_result",
                    "result",
                ]),
            },
        },
        BridgeProduct {
            name: "veo3".to_string(),
            alias: "veo3_fast_i2v".to_string(),
            paths: names(&["/mcp/i2v/fal/veo3/fast", "/mcp/i2v/fal/veo3"]),
            synthetic_paths: Vec::new(),
            schema: ToolSchemaKind::Video,
            fallbacks: FallbackCandidates {
                submit: names(&["veo3_fast_i2v_submit", "veo3_submit", "submit"]),
                status: names(&["veo3_fast_i2v_status", "veo3_status", "get_status", "status"]),
                result: names(&["veo3_fast_i2v_result", "veo3_result", "get_result", "result"]),
            },
        },
        BridgeProduct {
            name: "hailuo".to_string(),
            alias: "hailuo_02".to_string(),
            paths: names(&["/mcp/i2v/fal/minimax/hailuo-02/pro"]),
            synthetic_paths: Vec::new(),
            schema: ToolSchemaKind::Video,
            fallbacks: FallbackCandidates {
                submit: names(&["hailuo_02_submit", "submit"]),
                status: names(&["hailuo_02_status", "status"]),
                result: names(&["hailuo_02_result", "result"]),
            },
        },
    ]
}

/// Paths served by dedicated routes; products may not claim them.
const RESERVED_PATHS: &[&str] = &["/mcp", "/mcp/sse", "/mcp/config.json"];

pub fn validate_products(products: &[BridgeProduct]) -> anyhow::Result<()> {
    use anyhow::bail;

    let mut seen: HashSet<&str> = HashSet::new();
    for p in products {
        if p.alias.trim().is_empty() {
            bail!("bridges.{}: alias must be non-empty", p.name);
        }
        if p.paths.is_empty() {
            bail!("bridges.{}: at least one path is required", p.name);
        }
        for path in p.paths.iter().chain(&p.synthetic_paths) {
            if !path.starts_with("/mcp/") {
                bail!("bridges.{}: path '{path}' must start with /mcp/", p.name);
            }
            if RESERVED_PATHS.contains(&path.as_str()) || path.contains('{') {
                bail!("bridges.{}: path '{path}' is reserved", p.name);
            }
            if !seen.insert(path.as_str()) {
                bail!("bridges.{}: path '{path}' is bound more than once", p.name);
            }
        }
        for op in Operation::ALL {
            if p.fallbacks.for_operation(op).is_empty() {
                bail!(
                    "bridges.{}: fallbacks.{} must be non-empty",
                    p.name,
                    op.suffix()
                );
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_alias_suffix_case_insensitively() {
        let products = builtin_products();
        let nano = &products[0];
        assert_eq!(
            nano.recognize("nano_banana_edit_submit"),
            Some(Operation::Submit)
        );
        assert_eq!(
            nano.recognize("NANO_BANANA_EDIT_Status"),
            Some(Operation::Status)
        );
        assert_eq!(
            nano.recognize("fal_nano_banana_edit_result"),
            Some(Operation::Result)
        );
        assert_eq!(nano.recognize("nano_banana_edit_submit_v2"), None);
        assert_eq!(nano.recognize("seedream_edit_submit"), None);
        assert_eq!(nano.recognize("submit"), None);
    }

    #[test]
    fn every_builtin_product_recognizes_its_own_three_tool_names_only() {
        let products = builtin_products();
        for p in &products {
            for op in Operation::ALL {
                assert_eq!(p.recognize(&p.tool_name(op)), Some(op), "{}", p.name);
            }
            for other in products.iter().filter(|o| o.alias != p.alias) {
                for op in Operation::ALL {
                    assert_eq!(p.recognize(&other.tool_name(op)), None, "{}", p.name);
                }
            }
        }
    }

    #[test]
    fn builtin_products_are_valid() {
        validate_products(&builtin_products()).expect("valid");
    }

    #[test]
    fn validate_rejects_duplicate_and_reserved_paths() {
        let mut products = builtin_products();
        products[1].paths.push("/mcp/i2i/fal/nano-banana".to_string());
        let err = validate_products(&products).unwrap_err().to_string();
        assert!(err.contains("more than once"), "err: {err}");

        let mut products = builtin_products();
        products[0].synthetic_paths.push("/mcp/sse".to_string());
        let err = validate_products(&products).unwrap_err().to_string();
        assert!(err.contains("reserved"), "err: {err}");
    }

    #[test]
    fn validate_rejects_empty_fallbacks() {
        let mut products = builtin_products();
        products[3].fallbacks.status.clear();
        let err = validate_products(&products).unwrap_err().to_string();
        assert!(err.contains("fallbacks.status"), "err: {err}");
    }
}
