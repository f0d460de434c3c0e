//! Typed VM configuration.
//!
//! Untrusted JSON from clients is validated field-by-field into [`VmConfig`];
//! the untyped representation only exists at the parse/serialize boundary.
//! Unknown keys are rejected at every level, so schema additions are always
//! an explicit code change. Validation reports the first offending field
//! with a message that names it.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Smallest accepted memory size in bytes (128 MiB).
pub const MIN_MEMORY_BYTES: u64 = 134_217_728;

/// Smallest accepted disk size in MiB.
pub const MIN_DISK_SIZE_MIB: u64 = 64;

/// Smallest accepted display edge in pixels.
pub const MIN_GRAPHICS_DIM: u32 = 64;

const TOP_KEYS: [&str; 6] = ["cpu", "memory", "boot", "disk", "network", "graphics"];
const BOOT_KEYS: [&str; 4] = ["loader", "kernelPath", "initrdPath", "commandLine"];
const DISK_KEYS: [&str; 2] = ["path", "sizeMiB"];
const NETWORK_KEYS: [&str; 1] = ["mode"];
const GRAPHICS_KEYS: [&str; 3] = ["enabled", "width", "height"];

/// A configuration value failed validation.
///
/// `Display` renders only the message (it is surfaced verbatim in −32602
/// responses); the offending field is available separately.
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("{message}")]
    Invalid { field: String, message: String },
}

impl ConfigError {
    fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Dotted path of the field that failed first.
    #[must_use]
    pub fn field(&self) -> &str {
        match self {
            ConfigError::Invalid { field, .. } => field,
        }
    }
}

/// The complete six-field VM configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct VmConfig {
    pub cpu: u32,
    pub memory: u64,
    pub boot: BootConfig,
    pub disk: DiskConfig,
    pub network: NetworkConfig,
    pub graphics: GraphicsConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct BootConfig {
    pub loader: String,
    pub kernel_path: Option<String>,
    pub initrd_path: Option<String>,
    pub command_line: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DiskConfig {
    pub path: Option<String>,
    #[serde(rename = "sizeMiB")]
    pub size_mib: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetworkConfig {
    pub mode: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GraphicsConfig {
    pub enabled: bool,
    pub width: u32,
    pub height: u32,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            cpu: 2,
            memory: 2 * 1024 * 1024 * 1024,
            boot: BootConfig {
                loader: "linux".to_owned(),
                kernel_path: None,
                initrd_path: None,
                command_line: None,
            },
            disk: DiskConfig {
                path: None,
                size_mib: Some(8192),
            },
            network: NetworkConfig {
                mode: "shared".to_owned(),
            },
            graphics: GraphicsConfig {
                enabled: true,
                width: 1280,
                height: 800,
            },
        }
    }
}

impl VmConfig {
    /// Validate an untrusted JSON value into a typed configuration.
    ///
    /// Total on JSON values: either the exact six-key shape is accepted or
    /// the first offending field is named in the error.
    ///
    /// # Errors
    /// [`ConfigError::Invalid`] naming the first offending field.
    pub fn validate(value: &Value) -> Result<VmConfig, ConfigError> {
        let map = as_object(value, "config")?;
        reject_unknown_keys(map, &TOP_KEYS, None)?;

        let cpu = require_u32_min(map, "cpu", "cpu", 1, "cpu must be an integer >= 1")?;
        let memory = require_u64_min(
            map,
            "memory",
            "memory",
            MIN_MEMORY_BYTES,
            &format!("memory must be an integer >= {MIN_MEMORY_BYTES}"),
        )?;
        let boot = validate_boot(require_key(map, "boot", "boot")?)?;
        let disk = validate_disk(require_key(map, "disk", "disk")?)?;
        let network = validate_network(require_key(map, "network", "network")?)?;
        let graphics = validate_graphics(require_key(map, "graphics", "graphics")?)?;

        Ok(VmConfig {
            cpu,
            memory,
            boot,
            disk,
            network,
            graphics,
        })
    }

    /// Validate a sparse patch: top-level keys must be a subset of the six,
    /// nested objects may be partial, and every present leaf is checked
    /// against the same bounds as [`validate`](Self::validate). Leaves that
    /// do not exist in the schema cannot be added.
    ///
    /// # Errors
    /// [`ConfigError::Invalid`] naming the first offending field.
    pub fn validate_patch(patch: &Value) -> Result<(), ConfigError> {
        let map = as_object(patch, "patch")?;
        reject_unknown_keys(map, &TOP_KEYS, None)?;

        if let Some(v) = map.get("cpu") {
            parse_u32_min(v, "cpu", 1, "cpu must be an integer >= 1")?;
        }
        if let Some(v) = map.get("memory") {
            parse_u64_min(
                v,
                "memory",
                MIN_MEMORY_BYTES,
                &format!("memory must be an integer >= {MIN_MEMORY_BYTES}"),
            )?;
        }
        if let Some(v) = map.get("boot") {
            let boot = as_object(v, "boot")?;
            reject_unknown_keys(boot, &BOOT_KEYS, Some("boot"))?;
            if let Some(loader) = boot.get("loader") {
                parse_string(loader, "boot.loader")?;
            }
            for key in ["kernelPath", "initrdPath", "commandLine"] {
                if let Some(v) = boot.get(key) {
                    parse_nullable_string(v, &format!("boot.{key}"))?;
                }
            }
        }
        if let Some(v) = map.get("disk") {
            let disk = as_object(v, "disk")?;
            reject_unknown_keys(disk, &DISK_KEYS, Some("disk"))?;
            if let Some(path) = disk.get("path") {
                parse_nullable_string(path, "disk.path")?;
            }
            if let Some(size) = disk.get("sizeMiB") {
                parse_nullable_u64_min(
                    size,
                    "disk.sizeMiB",
                    MIN_DISK_SIZE_MIB,
                    &format!("disk.sizeMiB must be an integer >= {MIN_DISK_SIZE_MIB} or null"),
                )?;
            }
        }
        if let Some(v) = map.get("network") {
            let network = as_object(v, "network")?;
            reject_unknown_keys(network, &NETWORK_KEYS, Some("network"))?;
            if let Some(mode) = network.get("mode") {
                parse_string(mode, "network.mode")?;
            }
        }
        if let Some(v) = map.get("graphics") {
            let graphics = as_object(v, "graphics")?;
            reject_unknown_keys(graphics, &GRAPHICS_KEYS, Some("graphics"))?;
            if let Some(enabled) = graphics.get("enabled") {
                if !enabled.is_boolean() {
                    return Err(ConfigError::invalid(
                        "graphics.enabled",
                        "graphics.enabled must be a boolean",
                    ));
                }
            }
            for key in ["width", "height"] {
                if let Some(v) = graphics.get(key) {
                    parse_u32_min(
                        v,
                        &format!("graphics.{key}"),
                        MIN_GRAPHICS_DIM,
                        &format!("graphics.{key} must be an integer >= {MIN_GRAPHICS_DIM}"),
                    )?;
                }
            }
        }
        Ok(())
    }

    /// Field names from the restart-required set that differ between `self`
    /// and `next`. Empty means the change can be applied live.
    #[must_use]
    pub fn changed_restart_fields(&self, next: &VmConfig) -> Vec<&'static str> {
        let mut changed = Vec::new();
        if self.cpu != next.cpu {
            changed.push("cpu");
        }
        if self.memory != next.memory {
            changed.push("memory");
        }
        if self.boot != next.boot {
            changed.push("boot");
        }
        if self.disk.path != next.disk.path {
            changed.push("disk.path");
        }
        if self.network.mode != next.network.mode {
            changed.push("network.mode");
        }
        if self.graphics != next.graphics {
            changed.push("graphics");
        }
        changed
    }

    /// Whether switching from `self` to `next` demands a driver restart.
    #[must_use]
    pub fn restart_required(&self, next: &VmConfig) -> bool {
        !self.changed_restart_fields(next).is_empty()
    }
}

/// Deep-merge `patch` into `base`: objects recurse, scalars and nulls
/// replace. Arrays would also replace, but no schema field is an array.
#[must_use]
pub fn deep_merge(base: &Value, patch: &Value) -> Value {
    match (base, patch) {
        (Value::Object(base_map), Value::Object(patch_map)) => {
            let mut merged = base_map.clone();
            for (key, patch_value) in patch_map {
                let next = match merged.get(key) {
                    Some(base_value) => deep_merge(base_value, patch_value),
                    None => patch_value.clone(),
                };
                merged.insert(key.clone(), next);
            }
            Value::Object(merged)
        }
        (_, replacement) => replacement.clone(),
    }
}

// ── Field validators ─────────────────────────────────────────────────────────

fn as_object<'a>(value: &'a Value, path: &str) -> Result<&'a Map<String, Value>, ConfigError> {
    value
        .as_object()
        .ok_or_else(|| ConfigError::invalid(path, format!("{path} must be an object")))
}

fn reject_unknown_keys(
    map: &Map<String, Value>,
    allowed: &[&str],
    prefix: Option<&str>,
) -> Result<(), ConfigError> {
    for key in map.keys() {
        if !allowed.contains(&key.as_str()) {
            let path = match prefix {
                Some(prefix) => format!("{prefix}.{key}"),
                None => key.clone(),
            };
            return Err(ConfigError::invalid(
                path.clone(),
                format!("unknown field {path}"),
            ));
        }
    }
    Ok(())
}

fn require_key<'a>(
    map: &'a Map<String, Value>,
    key: &str,
    path: &str,
) -> Result<&'a Value, ConfigError> {
    map.get(key)
        .ok_or_else(|| ConfigError::invalid(path, format!("{path} is required")))
}

fn parse_u64_min(value: &Value, path: &str, min: u64, message: &str) -> Result<u64, ConfigError> {
    match value.as_u64() {
        Some(n) if n >= min => Ok(n),
        _ => Err(ConfigError::invalid(path, message)),
    }
}

fn parse_u32_min(value: &Value, path: &str, min: u32, message: &str) -> Result<u32, ConfigError> {
    let n = parse_u64_min(value, path, u64::from(min), message)?;
    u32::try_from(n).map_err(|_| ConfigError::invalid(path, message))
}

fn require_u64_min(
    map: &Map<String, Value>,
    key: &str,
    path: &str,
    min: u64,
    message: &str,
) -> Result<u64, ConfigError> {
    parse_u64_min(require_key(map, key, path)?, path, min, message)
}

fn require_u32_min(
    map: &Map<String, Value>,
    key: &str,
    path: &str,
    min: u32,
    message: &str,
) -> Result<u32, ConfigError> {
    parse_u32_min(require_key(map, key, path)?, path, min, message)
}

fn parse_string(value: &Value, path: &str) -> Result<String, ConfigError> {
    value
        .as_str()
        .map(ToOwned::to_owned)
        .ok_or_else(|| ConfigError::invalid(path, format!("{path} must be a string")))
}

fn parse_nullable_string(value: &Value, path: &str) -> Result<Option<String>, ConfigError> {
    match value {
        Value::Null => Ok(None),
        Value::String(s) => Ok(Some(s.clone())),
        _ => Err(ConfigError::invalid(
            path,
            format!("{path} must be a string or null"),
        )),
    }
}

fn parse_nullable_u64_min(
    value: &Value,
    path: &str,
    min: u64,
    message: &str,
) -> Result<Option<u64>, ConfigError> {
    match value {
        Value::Null => Ok(None),
        other => parse_u64_min(other, path, min, message).map(Some),
    }
}

fn validate_boot(value: &Value) -> Result<BootConfig, ConfigError> {
    let map = as_object(value, "boot")?;
    reject_unknown_keys(map, &BOOT_KEYS, Some("boot"))?;
    Ok(BootConfig {
        loader: parse_string(require_key(map, "loader", "boot.loader")?, "boot.loader")?,
        kernel_path: parse_nullable_string(
            require_key(map, "kernelPath", "boot.kernelPath")?,
            "boot.kernelPath",
        )?,
        initrd_path: parse_nullable_string(
            require_key(map, "initrdPath", "boot.initrdPath")?,
            "boot.initrdPath",
        )?,
        command_line: parse_nullable_string(
            require_key(map, "commandLine", "boot.commandLine")?,
            "boot.commandLine",
        )?,
    })
}

fn validate_disk(value: &Value) -> Result<DiskConfig, ConfigError> {
    let map = as_object(value, "disk")?;
    reject_unknown_keys(map, &DISK_KEYS, Some("disk"))?;
    Ok(DiskConfig {
        path: parse_nullable_string(require_key(map, "path", "disk.path")?, "disk.path")?,
        size_mib: parse_nullable_u64_min(
            require_key(map, "sizeMiB", "disk.sizeMiB")?,
            "disk.sizeMiB",
            MIN_DISK_SIZE_MIB,
            &format!("disk.sizeMiB must be an integer >= {MIN_DISK_SIZE_MIB} or null"),
        )?,
    })
}

fn validate_network(value: &Value) -> Result<NetworkConfig, ConfigError> {
    let map = as_object(value, "network")?;
    reject_unknown_keys(map, &NETWORK_KEYS, Some("network"))?;
    Ok(NetworkConfig {
        mode: parse_string(require_key(map, "mode", "network.mode")?, "network.mode")?,
    })
}

fn validate_graphics(value: &Value) -> Result<GraphicsConfig, ConfigError> {
    let map = as_object(value, "graphics")?;
    reject_unknown_keys(map, &GRAPHICS_KEYS, Some("graphics"))?;
    let Some(enabled) = require_key(map, "enabled", "graphics.enabled")?.as_bool() else {
        return Err(ConfigError::invalid(
            "graphics.enabled",
            "graphics.enabled must be a boolean",
        ));
    };
    Ok(GraphicsConfig {
        enabled,
        width: require_u32_min(
            map,
            "width",
            "graphics.width",
            MIN_GRAPHICS_DIM,
            &format!("graphics.width must be an integer >= {MIN_GRAPHICS_DIM}"),
        )?,
        height: require_u32_min(
            map,
            "height",
            "graphics.height",
            MIN_GRAPHICS_DIM,
            &format!("graphics.height must be an integer >= {MIN_GRAPHICS_DIM}"),
        )?,
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn default_value() -> Value {
        serde_json::to_value(VmConfig::default()).expect("default serializes")
    }

    #[test]
    fn default_config_validates() {
        let config = VmConfig::validate(&default_value()).expect("default must validate");
        assert_eq!(config, VmConfig::default());
    }

    #[test]
    fn default_serializes_expected_wire_names() {
        let value = default_value();
        assert_eq!(value["boot"]["kernelPath"], Value::Null);
        assert_eq!(value["disk"]["sizeMiB"], 8192);
        assert_eq!(value["graphics"]["width"], 1280);
    }

    #[test]
    fn cpu_zero_names_the_field() {
        let mut value = default_value();
        value["cpu"] = json!(0);
        let err = VmConfig::validate(&value).expect_err("cpu 0 must fail");
        assert_eq!(err.to_string(), "cpu must be an integer >= 1");
        assert_eq!(err.field(), "cpu");
    }

    #[test]
    fn memory_below_floor_is_rejected() {
        let mut value = default_value();
        value["memory"] = json!(MIN_MEMORY_BYTES - 1);
        let err = VmConfig::validate(&value).expect_err("must fail");
        assert!(err.to_string().starts_with("memory must be"), "got: {err}");
    }

    #[test]
    fn missing_top_level_key_is_rejected() {
        let mut value = default_value();
        value.as_object_mut().expect("object").remove("network");
        let err = VmConfig::validate(&value).expect_err("must fail");
        assert_eq!(err.to_string(), "network is required");
    }

    #[test]
    fn unknown_top_level_key_is_rejected() {
        let mut value = default_value();
        value["snapshots"] = json!(true);
        let err = VmConfig::validate(&value).expect_err("must fail");
        assert_eq!(err.to_string(), "unknown field snapshots");
    }

    #[test]
    fn unknown_nested_key_is_rejected() {
        let mut value = default_value();
        value["boot"]["firmware"] = json!("efi");
        let err = VmConfig::validate(&value).expect_err("must fail");
        assert_eq!(err.to_string(), "unknown field boot.firmware");
    }

    #[test]
    fn nullable_fields_accept_null_and_string() {
        let mut value = default_value();
        value["boot"]["kernelPath"] = json!("/boot/vmlinuz");
        value["disk"]["sizeMiB"] = Value::Null;
        let config = VmConfig::validate(&value).expect("must validate");
        assert_eq!(config.boot.kernel_path.as_deref(), Some("/boot/vmlinuz"));
        assert_eq!(config.disk.size_mib, None);
    }

    #[test]
    fn disk_size_below_floor_is_rejected() {
        let mut value = default_value();
        value["disk"]["sizeMiB"] = json!(32);
        let err = VmConfig::validate(&value).expect_err("must fail");
        assert_eq!(err.to_string(), "disk.sizeMiB must be an integer >= 64 or null");
    }

    #[test]
    fn graphics_enabled_must_be_boolean() {
        let mut value = default_value();
        value["graphics"]["enabled"] = json!(1);
        let err = VmConfig::validate(&value).expect_err("must fail");
        assert_eq!(err.to_string(), "graphics.enabled must be a boolean");
    }

    #[test]
    fn non_object_input_is_rejected_not_a_panic() {
        for value in [json!(null), json!(5), json!("x"), json!([1, 2])] {
            assert!(VmConfig::validate(&value).is_err(), "non-object {value} must be rejected");
        }
    }

    #[test]
    fn patch_accepts_partial_nested_object() {
        VmConfig::validate_patch(&json!({"graphics": {"enabled": false}}))
            .expect("partial graphics patch must validate");
    }

    #[test]
    fn patch_rejects_new_leaf() {
        let err = VmConfig::validate_patch(&json!({"disk": {"iops": 100}}))
            .expect_err("new leaf must be rejected");
        assert_eq!(err.to_string(), "unknown field disk.iops");
    }

    #[test]
    fn patch_rejects_out_of_bounds_leaf() {
        let err = VmConfig::validate_patch(&json!({"cpu": 0})).expect_err("must fail");
        assert_eq!(err.to_string(), "cpu must be an integer >= 1");
    }

    #[test]
    fn deep_merge_overwrites_only_patched_leaves() {
        let base = default_value();
        let patch = json!({"graphics": {"enabled": false}, "cpu": 4});
        let merged = deep_merge(&base, &patch);
        assert_eq!(merged["cpu"], 4);
        assert_eq!(merged["graphics"]["enabled"], false);
        assert_eq!(merged["graphics"]["width"], 1280, "unpatched leaf must survive");
        assert_eq!(merged["memory"], base["memory"], "unpatched top-level must survive");
    }

    #[test]
    fn deep_merge_null_replaces_scalar() {
        let base = default_value();
        let merged = deep_merge(&base, &json!({"boot": {"kernelPath": null}}));
        assert_eq!(merged["boot"]["kernelPath"], Value::Null);
    }

    #[test]
    fn restart_diff_is_reflexively_false() {
        let config = VmConfig::default();
        assert!(!config.restart_required(&config.clone()), "identical configs never restart");
    }

    #[test]
    fn disk_size_change_is_not_restart_required() {
        let current = VmConfig::default();
        let mut next = current.clone();
        next.disk.size_mib = Some(16_384);
        assert!(!current.restart_required(&next), "sizeMiB is resizable live");
    }

    #[test]
    fn each_restart_field_triggers_the_diff() {
        let current = VmConfig::default();

        let mut next = current.clone();
        next.cpu = 4;
        assert_eq!(current.changed_restart_fields(&next), vec!["cpu"]);

        let mut next = current.clone();
        next.boot.command_line = Some("quiet".to_owned());
        assert_eq!(current.changed_restart_fields(&next), vec!["boot"]);

        let mut next = current.clone();
        next.disk.path = Some("/var/vm/disk.img".to_owned());
        assert_eq!(current.changed_restart_fields(&next), vec!["disk.path"]);

        let mut next = current.clone();
        next.network.mode = "bridged".to_owned();
        assert_eq!(current.changed_restart_fields(&next), vec!["network.mode"]);

        let mut next = current.clone();
        next.graphics.enabled = false;
        assert_eq!(current.changed_restart_fields(&next), vec!["graphics"]);
    }

    proptest::proptest! {
        /// Merged patches win on patched leaves and never touch others.
        #[test]
        fn proptest_merge_patched_leaves_win(
            cpu in proptest::option::of(1u32..128),
            width in proptest::option::of(64u32..4096),
            mode in proptest::option::of("[a-z]{1,8}"),
        ) {
            let base = default_value();
            let mut patch = serde_json::Map::new();
            if let Some(cpu) = cpu {
                patch.insert("cpu".to_owned(), json!(cpu));
            }
            if let Some(width) = width {
                patch.insert("graphics".to_owned(), json!({"width": width}));
            }
            if let Some(mode) = &mode {
                patch.insert("network".to_owned(), json!({"mode": mode}));
            }
            let patch = Value::Object(patch);
            VmConfig::validate_patch(&patch).expect("generated patch must validate");
            let merged = deep_merge(&base, &patch);

            // Patched leaves take the patch value.
            if let Some(cpu) = cpu {
                proptest::prop_assert_eq!(&merged["cpu"], &json!(cpu));
            }
            if let Some(width) = width {
                proptest::prop_assert_eq!(&merged["graphics"]["width"], &json!(width));
            }
            if let Some(mode) = &mode {
                proptest::prop_assert_eq!(&merged["network"]["mode"], &json!(mode));
            }
            // Disjoint leaves keep the base value.
            proptest::prop_assert_eq!(&merged["memory"], &base["memory"]);
            proptest::prop_assert_eq!(&merged["graphics"]["height"], &base["graphics"]["height"]);
            proptest::prop_assert_eq!(&merged["boot"], &base["boot"]);

            // And the merge of valid inputs revalidates.
            VmConfig::validate(&merged).expect("merged config must validate");
        }
    }
}
