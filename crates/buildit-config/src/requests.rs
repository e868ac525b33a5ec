//! Build request fixtures, used to seed a store for simulation.

use crate::nodes::{get_i64_prop, get_string_prop};
use crate::{ConfigError, ConfigErrors, ConfigResult, ErrorCollector};
use buildit_core::{NewBuildRequest, SourceStamp};
use chrono::DateTime;
use kdl::{KdlDocument, KdlNode};
use std::path::Path;

pub fn load_build_requests(path: impl AsRef<Path>) -> Result<Vec<NewBuildRequest>, ConfigErrors> {
    let text = std::fs::read_to_string(path).map_err(ConfigError::from)?;
    parse_build_requests(&text)
}

/// Parse `request` nodes. `submitted-at` is in seconds since the epoch.
pub fn parse_build_requests(kdl: &str) -> Result<Vec<NewBuildRequest>, ConfigErrors> {
    let doc: KdlDocument = kdl.parse().map_err(ConfigError::from)?;
    let mut errors = ErrorCollector::new();

    let requests: Vec<NewBuildRequest> = doc
        .nodes()
        .iter()
        .enumerate()
        .filter(|(_, node)| node.name().value() == "request")
        .filter_map(|(index, node)| errors.collect(parse_request(node, index)))
        .collect();

    errors.finish(requests)
}

fn parse_request(node: &KdlNode, index: usize) -> ConfigResult<NewBuildRequest> {
    let builder = get_string_prop(node, "builder")
        .ok_or_else(|| ConfigError::MissingField(format!("builder of request #{}", index + 1)))?;
    let seconds = get_i64_prop(node, "submitted-at")?.ok_or_else(|| {
        ConfigError::MissingField(format!("submitted-at of request #{}", index + 1))
    })?;
    let submitted_at = DateTime::from_timestamp(seconds, 0)
        .ok_or_else(|| ConfigError::invalid("submitted-at", format!("{} is out of range", seconds)))?;

    let mut request = NewBuildRequest::new(builder, submitted_at);
    if let Some(buildset) = get_i64_prop(node, "buildset")? {
        request = request.with_buildset(buildset);
    }
    if let Some(priority) = get_i64_prop(node, "priority")? {
        let priority = i32::try_from(priority)
            .map_err(|_| ConfigError::invalid("priority", format!("{} is out of range", priority)))?;
        request = request.with_priority(priority);
    }

    if let Some(children) = node.children() {
        for child in children.nodes() {
            if child.name().value() == "sourcestamp" {
                request = request.with_sourcestamp(parse_sourcestamp(child));
            }
        }
    }
    Ok(request)
}

fn parse_sourcestamp(node: &KdlNode) -> SourceStamp {
    let mut stamp = SourceStamp::new(
        get_string_prop(node, "codebase").unwrap_or_default(),
        get_string_prop(node, "repository").unwrap_or_default(),
    );
    stamp.project = get_string_prop(node, "project").unwrap_or_default();
    stamp.branch = get_string_prop(node, "branch");
    stamp.revision = get_string_prop(node, "revision");
    stamp.patch = get_string_prop(node, "patch");
    stamp
}
