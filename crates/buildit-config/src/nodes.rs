//! Helpers for extracting values from KDL nodes.

use crate::{ConfigError, ConfigResult};
use kdl::KdlNode;

pub(crate) fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

pub(crate) fn get_all_string_args(node: &KdlNode) -> Vec<String> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .filter_map(|e| e.value().as_string())
        .map(|s| s.to_string())
        .collect()
}

pub(crate) fn get_string_prop(node: &KdlNode, name: &str) -> Option<String> {
    node.get(name)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

/// A boolean property, or the node's first argument for `name #true` style nodes.
pub(crate) fn get_bool(node: &KdlNode, name: &str) -> Option<bool> {
    node.get(name).and_then(|v| v.as_bool()).or_else(|| {
        node.entries()
            .iter()
            .find(|e| e.name().is_none())
            .and_then(|e| e.value().as_bool())
    })
}

pub(crate) fn get_i64_prop(node: &KdlNode, name: &str) -> ConfigResult<Option<i64>> {
    let Some(value) = node.get(name) else {
        return Ok(None);
    };
    value
        .as_integer()
        .and_then(|v| i64::try_from(v).ok())
        .map(Some)
        .ok_or_else(|| ConfigError::invalid(name, format!("expected an integer, got {}", value)))
}

/// A positive count that fits a lock's max count.
pub(crate) fn get_count_prop(node: &KdlNode, name: &str) -> ConfigResult<Option<u32>> {
    let Some(value) = node.get(name) else {
        return Ok(None);
    };
    match value.as_integer().map(u32::try_from) {
        Some(Ok(count)) if count > 0 => Ok(Some(count)),
        _ => Err(ConfigError::invalid(
            name,
            format!("expected a positive integer, got {}", value),
        )),
    }
}
