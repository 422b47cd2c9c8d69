//! Node configuration.
//!
//! A single [`SectionConfig`] instance, built once behind a `lazy_static`,
//! that parses a flat key/value file into typed data. Only one section is
//! ever expected (this process's own node identity), so there is no need
//! for an `id -> (section_type, value)` lookup table beyond picking the
//! lone entry out of the parsed map.

use std::path::Path;

use anyhow::{bail, Context, Error};
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};

use proxmox::api::schema::{BooleanSchema, IntegerSchema, ObjectSchema, Schema, StringSchema};
use proxmox::api::section_config::{SectionConfig, SectionConfigPlugin};

use crate::errors::NodeError;

const NODENAME_SCHEMA: Schema = StringSchema::new("Node name.").min_length(1).schema();

const DDFS_ROOT_SCHEMA: Schema = StringSchema::new("Root directory containing volumes.").schema();

const DISCO_ROOT_SCHEMA: Schema =
    StringSchema::new("Secondary root passed to the get listener.").schema();

const PUT_MAX_SCHEMA: Schema = IntegerSchema::new("Put admission capacity (running).")
    .minimum(1)
    .schema();

const GET_MAX_SCHEMA: Schema = IntegerSchema::new("Get admission capacity (running).")
    .minimum(1)
    .schema();

const PUT_PORT_SCHEMA: Schema = IntegerSchema::new("Put listener port.")
    .minimum(1)
    .maximum(65535)
    .schema();

const GET_PORT_SCHEMA: Schema = IntegerSchema::new("Get listener port.")
    .minimum(1)
    .maximum(65535)
    .schema();

const PUT_ENABLED_SCHEMA: Schema = BooleanSchema::new("Start the put listener at init.").schema();

const GET_ENABLED_SCHEMA: Schema = BooleanSchema::new("Start the get listener at init.").schema();

const HTTP_QUEUE_LENGTH_SCHEMA: Schema = IntegerSchema::new("Max waiting per admission queue.")
    .minimum(0)
    .schema();

const DISK_INTERVAL_SCHEMA: Schema = IntegerSchema::new("Disk-space monitor period, in seconds.")
    .minimum(1)
    .schema();

const TAG_INTERVAL_SCHEMA: Schema = IntegerSchema::new("Tag-index refresh period, in seconds.")
    .minimum(1)
    .schema();

const NODE_STARTUP_SCHEMA: Schema = IntegerSchema::new("Bound on init duration, in seconds.")
    .minimum(1)
    .schema();

const NODE_PROPERTIES: ObjectSchema = ObjectSchema::new(
    "ddfs node properties",
    &[
        ("nodename", false, &NODENAME_SCHEMA),
        ("ddfs_root", false, &DDFS_ROOT_SCHEMA),
        ("disco_root", true, &DISCO_ROOT_SCHEMA),
        ("put_max", true, &PUT_MAX_SCHEMA),
        ("get_max", true, &GET_MAX_SCHEMA),
        ("put_port", true, &PUT_PORT_SCHEMA),
        ("get_port", true, &GET_PORT_SCHEMA),
        ("put_enabled", true, &PUT_ENABLED_SCHEMA),
        ("get_enabled", true, &GET_ENABLED_SCHEMA),
        ("http_queue_length", true, &HTTP_QUEUE_LENGTH_SCHEMA),
        ("disk_interval", true, &DISK_INTERVAL_SCHEMA),
        ("tag_interval", true, &TAG_INTERVAL_SCHEMA),
        ("node_startup", true, &NODE_STARTUP_SCHEMA),
    ],
);

lazy_static! {
    static ref CONFIG: SectionConfig = init();
}

fn init() -> SectionConfig {
    let plugin = SectionConfigPlugin::new(
        "node".to_string(),
        Some("nodename".to_string()),
        &NODE_PROPERTIES,
    );
    let mut config = SectionConfig::new(&NODENAME_SCHEMA);
    config.register_plugin(plugin);
    config
}

/// Raw, pre-default view of the properties as they came out of the config
/// file. Every field but `nodename`/`ddfs_root` is optional on disk; we
/// apply defaults when building a [`NodeConfig`].
#[derive(Debug, Default, Serialize, Deserialize)]
struct RawNodeProperties {
    ddfs_root: String,
    disco_root: Option<String>,
    put_max: Option<u32>,
    get_max: Option<u32>,
    put_port: Option<u16>,
    get_port: Option<u16>,
    put_enabled: Option<bool>,
    get_enabled: Option<bool>,
    http_queue_length: Option<u32>,
    disk_interval: Option<u64>,
    tag_interval: Option<u64>,
    node_startup: Option<u64>,
}

/// The parsed, validated, defaulted configuration for this node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub nodename: String,
    pub ddfs_root: String,
    pub disco_root: String,
    pub put_max: usize,
    pub get_max: usize,
    pub put_port: u16,
    pub get_port: u16,
    pub put_enabled: bool,
    pub get_enabled: bool,
    pub http_queue_length: usize,
    pub disk_interval: std::time::Duration,
    pub tag_interval: std::time::Duration,
    pub node_startup: std::time::Duration,
}

/// Load and validate the node configuration file at `path`.
///
/// A missing file is tolerated (parsed as empty) but the file must then
/// contain exactly one `node` section, or loading fails loudly with
/// [`NodeError::ConfigMissing`]. A required key absent or failing schema
/// validation also aborts with `ConfigMissing`.
pub fn load(path: &Path) -> Result<NodeConfig, Error> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(err) => {
            return Err(err).with_context(|| format!("unable to read {:?}", path));
        }
    };

    let filename = path.to_string_lossy().into_owned();
    let data = CONFIG
        .parse(&filename, &content)
        .with_context(|| format!("unable to parse {:?}", path))?;

    if data.sections.len() != 1 {
        bail!(NodeError::ConfigMissing { key: "node" });
    }

    let (nodename, (section_type, value)) = data
        .sections
        .into_iter()
        .next()
        .expect("checked len == 1 above");

    if section_type != "node" {
        bail!(NodeError::internal(format!(
            "unexpected section type {:?}",
            section_type
        )));
    }

    let raw: RawNodeProperties = serde_json::from_value(value)
        .map_err(|_| NodeError::ConfigMissing { key: "ddfs_root" })?;

    if nodename.is_empty() {
        bail!(NodeError::ConfigMissing { key: "nodename" });
    }

    Ok(NodeConfig {
        nodename,
        ddfs_root: raw.ddfs_root,
        disco_root: raw.disco_root.unwrap_or_default(),
        put_max: raw.put_max.unwrap_or(4) as usize,
        get_max: raw.get_max.unwrap_or(4) as usize,
        put_port: raw.put_port.unwrap_or(8001),
        get_port: raw.get_port.unwrap_or(8002),
        put_enabled: raw.put_enabled.unwrap_or(true),
        get_enabled: raw.get_enabled.unwrap_or(true),
        http_queue_length: raw.http_queue_length.unwrap_or(16) as usize,
        disk_interval: std::time::Duration::from_secs(raw.disk_interval.unwrap_or(60)),
        tag_interval: std::time::Duration::from_secs(raw.tag_interval.unwrap_or(60)),
        node_startup: std::time::Duration::from_secs(raw.node_startup.unwrap_or(30)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_minimal_config() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "node: n0").unwrap();
        writeln!(file, "\tddfs_root /tmp/ddfs").unwrap();
        let cfg = load(file.path()).unwrap();
        assert_eq!(cfg.nodename, "n0");
        assert_eq!(cfg.ddfs_root, "/tmp/ddfs");
        assert_eq!(cfg.put_max, 4);
        assert!(cfg.put_enabled);
    }

    #[test]
    fn missing_file_is_config_missing() {
        let err = load(Path::new("/nonexistent/ddfs-node.cfg")).unwrap_err();
        assert!(err.downcast_ref::<NodeError>().is_some());
    }
}
