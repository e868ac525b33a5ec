//! Master scheduling configuration: locks and builders.

use crate::nodes::{get_all_string_args, get_bool, get_count_prop, get_first_string_arg, get_string_prop};
use crate::{ConfigError, ConfigErrors, ConfigResult, ErrorCollector};
use buildit_core::{AccessMode, LockAccessSpec, LockSpec};
use kdl::{KdlDocument, KdlNode};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::str::FromStr;

/// How a builder picks among available workers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerPolicy {
    #[default]
    Random,
    First,
}

impl FromStr for WorkerPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "random" => Ok(Self::Random),
            "first" => Ok(Self::First),
            other => Err(format!("unknown worker policy: {}", other)),
        }
    }
}

/// How a builder picks the next request to build.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum BuildPolicy {
    #[default]
    Oldest,
    Priority,
}

impl FromStr for BuildPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "oldest" => Ok(Self::Oldest),
            "priority" => Ok(Self::Priority),
            other => Err(format!("unknown build policy: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuilderSpec {
    pub name: String,
    /// Worker names in preference order.
    pub workers: Vec<String>,
    pub locks: Vec<LockAccessSpec>,
    pub collapse_requests: bool,
    pub next_worker: WorkerPolicy,
    pub next_build: BuildPolicy,
}

impl BuilderSpec {
    pub fn new(name: impl Into<String>, workers: Vec<String>) -> Self {
        Self {
            name: name.into(),
            workers,
            locks: Vec::new(),
            collapse_requests: false,
            next_worker: WorkerPolicy::default(),
            next_build: BuildPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterConfig {
    pub locks: Vec<LockSpec>,
    pub builders: Vec<BuilderSpec>,
}

impl MasterConfig {
    pub fn builder(&self, name: &str) -> Option<&BuilderSpec> {
        self.builders.iter().find(|b| b.name == name)
    }

    pub fn worker_names(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.builders
            .iter()
            .flat_map(|b| b.workers.iter())
            .map(String::as_str)
            .filter(|w| seen.insert(*w))
            .collect()
    }
}

/// Read and parse a master configuration file.
pub fn load_master_config(path: impl AsRef<Path>) -> Result<MasterConfig, ConfigErrors> {
    let text = std::fs::read_to_string(path).map_err(ConfigError::from)?;
    parse_master_config(&text)
}

/// Parse a master configuration, reporting every problem found.
pub fn parse_master_config(kdl: &str) -> Result<MasterConfig, ConfigErrors> {
    let doc: KdlDocument = kdl.parse().map_err(ConfigError::from)?;
    let mut errors = ErrorCollector::new();
    let mut config = MasterConfig::default();

    for node in doc.nodes() {
        match node.name().value() {
            "lock" => {
                if let Some(spec) = errors.collect(parse_lock(node, false)) {
                    config.locks.push(spec);
                }
            }
            "worker-lock" => {
                if let Some(spec) = errors.collect(parse_lock(node, true)) {
                    config.locks.push(spec);
                }
            }
            "builder" => {
                if let Some(spec) = parse_builder(node, &mut errors) {
                    config.builders.push(spec);
                }
            }
            _ => {} // Ignore unknown nodes
        }
    }

    validate(&mut config, &mut errors);
    errors.finish(config)
}

fn parse_lock(node: &KdlNode, worker_scoped: bool) -> ConfigResult<LockSpec> {
    let name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("lock name".to_string()))?;
    let max_count = get_count_prop(node, "max-count")?.unwrap_or(1);

    if !worker_scoped {
        return Ok(LockSpec::master(name, max_count));
    }

    let mut spec = LockSpec::worker(name.clone(), max_count);
    if let Some(children) = node.children() {
        for child in children.nodes() {
            if child.name().value() != "worker" {
                continue;
            }
            let worker = get_first_string_arg(child).ok_or_else(|| {
                ConfigError::MissingField(format!("worker name in lock '{}'", name))
            })?;
            let count = get_count_prop(child, "max-count")?.ok_or_else(|| {
                ConfigError::MissingField(format!("max-count for worker '{}' in lock '{}'", worker, name))
            })?;
            spec = spec.with_worker_max_count(worker, count);
        }
    }
    Ok(spec)
}

fn parse_builder(node: &KdlNode, errors: &mut ErrorCollector) -> Option<BuilderSpec> {
    let Some(name) = get_first_string_arg(node) else {
        errors.add(ConfigError::MissingField("builder name".to_string()));
        return None;
    };
    let mut spec = BuilderSpec::new(name, Vec::new());

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "workers" => spec.workers.extend(get_all_string_args(child)),
                "lock" => {
                    if let Some(access) = errors.collect(parse_lock_access(child, &spec.name)) {
                        spec.locks.push(access);
                    }
                }
                "collapse-requests" => {
                    spec.collapse_requests = get_bool(child, "enabled").unwrap_or(true);
                }
                "next-worker" => {
                    let value = get_first_string_arg(child).unwrap_or_default();
                    match value.parse() {
                        Ok(policy) => spec.next_worker = policy,
                        Err(message) => errors.add(ConfigError::invalid(
                            format!("next-worker of builder '{}'", spec.name),
                            message,
                        )),
                    }
                }
                "next-build" => {
                    let value = get_first_string_arg(child).unwrap_or_default();
                    match value.parse() {
                        Ok(policy) => spec.next_build = policy,
                        Err(message) => errors.add(ConfigError::invalid(
                            format!("next-build of builder '{}'", spec.name),
                            message,
                        )),
                    }
                }
                _ => {}
            }
        }
    }

    if spec.workers.is_empty() {
        errors.add(ConfigError::MissingField(format!(
            "workers for builder '{}'",
            spec.name
        )));
    }
    Some(spec)
}

fn parse_lock_access(node: &KdlNode, builder: &str) -> ConfigResult<LockAccessSpec> {
    let lock = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField(format!("lock name in builder '{}'", builder)))?;
    let field = format!("access to lock '{}' in builder '{}'", lock, builder);

    let mode = match get_string_prop(node, "access") {
        Some(access) => AccessMode::from_str(&access).map_err(|m| ConfigError::invalid(&field, m))?,
        None => AccessMode::Counting,
    };
    let count = get_count_prop(node, "count")?.unwrap_or(1);

    Ok(match mode {
        AccessMode::Exclusive if count != 1 => {
            return Err(ConfigError::invalid(field, "exclusive access takes no count"));
        }
        AccessMode::Exclusive => LockAccessSpec::exclusive(lock),
        AccessMode::Counting => LockAccessSpec::counting(lock, count),
    })
}

/// Cross-node checks: duplicate names, unknown locks and oversized counts.
fn validate(config: &mut MasterConfig, errors: &mut ErrorCollector) {
    let mut locks: HashMap<&str, &LockSpec> = HashMap::new();
    let mut duplicates = HashSet::new();
    for spec in &config.locks {
        match locks.get(spec.name.as_str()) {
            Some(existing) if *existing != spec => {
                if duplicates.insert(spec.name.clone()) {
                    errors.add(ConfigError::Duplicate(format!(
                        "lock '{}' is defined twice with different settings",
                        spec.name
                    )));
                }
            }
            Some(_) => {}
            None => {
                locks.insert(&spec.name, spec);
            }
        }
    }

    let mut builders = HashSet::new();
    for builder in &config.builders {
        if !builders.insert(builder.name.as_str()) {
            errors.add(ConfigError::Duplicate(format!("builder '{}'", builder.name)));
        }

        let mut seen = HashSet::new();
        for access in &builder.locks {
            if !seen.insert(access.lock.as_str()) {
                errors.add(ConfigError::Duplicate(format!(
                    "lock '{}' declared twice in builder '{}'",
                    access.lock, builder.name
                )));
            }
            let Some(lock) = locks.get(access.lock.as_str()) else {
                errors.add(ConfigError::InvalidReference(format!(
                    "builder '{}' uses undeclared lock '{}'",
                    builder.name, access.lock
                )));
                continue;
            };
            for worker in &builder.workers {
                if access.count > lock.max_count_for(worker) {
                    errors.add(ConfigError::invalid(
                        format!("access to lock '{}' in builder '{}'", access.lock, builder.name),
                        format!(
                            "count {} exceeds max count {} on worker '{}'",
                            access.count,
                            lock.max_count_for(worker),
                            worker
                        ),
                    ));
                }
            }
        }
    }

    // identical repeats are harmless; keep one of each
    let mut kept = HashSet::new();
    config.locks.retain(|spec| kept.insert(spec.name.clone()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use buildit_core::LockScope;

    const EXAMPLE: &str = r#"
        lock "db" max-count=1
        worker-lock "cpu" max-count=2 {
            worker "big-box" max-count=8
        }

        builder "linux" {
            workers "w1" "w2" "big-box"
            lock "db" access="exclusive"
            lock "cpu" access="counting" count=1
            collapse-requests #true
            next-worker "first"
            next-build "priority"
        }

        builder "docs" {
            workers "w1"
        }
    "#;

    #[test]
    fn test_parse_example() {
        let config = parse_master_config(EXAMPLE).unwrap();
        assert_eq!(config.locks.len(), 2);
        assert_eq!(config.locks[0], LockSpec::master("db", 1));
        assert!(matches!(config.locks[1].scope, LockScope::Worker { .. }));
        assert_eq!(config.locks[1].max_count_for("big-box"), 8);
        assert_eq!(config.locks[1].max_count_for("w1"), 2);

        let linux = config.builder("linux").unwrap();
        assert_eq!(linux.workers, vec!["w1", "w2", "big-box"]);
        assert_eq!(
            linux.locks,
            vec![
                LockAccessSpec::exclusive("db"),
                LockAccessSpec::counting("cpu", 1)
            ]
        );
        assert!(linux.collapse_requests);
        assert_eq!(linux.next_worker, WorkerPolicy::First);
        assert_eq!(linux.next_build, BuildPolicy::Priority);

        let docs = config.builder("docs").unwrap();
        assert!(!docs.collapse_requests);
        assert_eq!(docs.next_worker, WorkerPolicy::Random);
        assert_eq!(docs.next_build, BuildPolicy::Oldest);

        assert_eq!(config.worker_names(), vec!["w1", "w2", "big-box"]);
    }

    #[test]
    fn test_reports_every_error() {
        let kdl = r#"
            lock "db" max-count=1
            lock "db" max-count=2
            builder "a" {
                workers "w1"
                lock "nope"
                next-worker "fastest"
            }
            builder "b"
            builder "a" {
                workers "w2"
            }
        "#;

        let errors = parse_master_config(kdl).unwrap_err();
        let errors = errors.errors();
        assert_eq!(errors.len(), 5);
        assert!(errors.iter().any(|e| matches!(e, ConfigError::Duplicate(m) if m.contains("lock 'db'"))));
        assert!(errors.iter().any(|e| matches!(e, ConfigError::InvalidReference(m) if m.contains("nope"))));
        assert!(errors.iter().any(|e| matches!(e, ConfigError::InvalidValue { field, .. } if field.contains("next-worker"))));
        assert!(errors.iter().any(|e| matches!(e, ConfigError::MissingField(m) if m.contains("builder 'b'"))));
        assert!(errors.iter().any(|e| matches!(e, ConfigError::Duplicate(m) if m == "builder 'a'")));
    }

    #[test]
    fn test_identical_lock_repeat_is_tolerated() {
        let kdl = r#"
            lock "db" max-count=2
            lock "db" max-count=2
        "#;
        let config = parse_master_config(kdl).unwrap();
        assert_eq!(config.locks, vec![LockSpec::master("db", 2)]);
    }

    #[test]
    fn test_access_count_checked_per_worker() {
        let kdl = r#"
            worker-lock "cpu" max-count=2 {
                worker "big-box" max-count=8
            }
            builder "heavy" {
                workers "big-box"
                lock "cpu" count=4
            }
            builder "too-heavy" {
                workers "big-box" "small"
                lock "cpu" count=4
            }
        "#;
        let errors = parse_master_config(kdl).unwrap_err();
        assert_eq!(errors.errors().len(), 1);
        assert!(errors.to_string().contains("worker 'small'"));
    }

    #[test]
    fn test_exclusive_with_count_rejected() {
        let kdl = r#"
            lock "db"
            builder "a" {
                workers "w1"
                lock "db" access="exclusive" count=2
            }
        "#;
        assert!(parse_master_config(kdl).is_err());
    }

    #[test]
    fn test_demo_config_is_valid() {
        let config = parse_master_config(include_str!("../../../demos/master.kdl")).unwrap();
        assert_eq!(config.builders.len(), 3);
        assert_eq!(config.builder("release").unwrap().next_build, BuildPolicy::Priority);
    }

    #[test]
    fn test_invalid_kdl() {
        let errors = parse_master_config("builder {").unwrap_err();
        assert!(matches!(errors.errors()[0], ConfigError::Parse(_)));
    }
}
