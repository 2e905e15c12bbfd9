use serde::Deserialize;

use crate::error::{VolumeError, VolumeResult};

/// Host-provided configuration. Every key is optional; missing keys fall
/// back to the defaults below. The host hands the core a flat JSON object
/// keyed by dotted names, e.g. `{"volume.max_depth": 6}`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct VolumeConfig {
    /// World size in leaf cells per axis. Default (64, 64, 64).
    #[serde(rename = "volume.world_dimensions")]
    pub world_dimensions: [u32; 3],

    /// Edge length of a leaf cell in world units. Default 1.0.
    #[serde(rename = "volume.leaf_node_size")]
    pub leaf_node_size: f32,

    /// Maximum octree depth. Default 6.
    #[serde(rename = "volume.max_depth")]
    pub max_depth: u8,

    /// Number of material channels (<= 256). Default 4.
    #[serde(rename = "volume.material_count")]
    pub material_count: u32,

    /// Evaluation accuracy epsilon. Default 1e-3.
    #[serde(rename = "distance_field.evaluation_accuracy")]
    pub evaluation_accuracy: f32,

    /// Evaluation cache capacity in entries. Default 65536.
    #[serde(rename = "distance_field.max_cache_size")]
    pub max_cache_size: usize,

    /// Whether the evaluation cache starts enabled. Default true.
    #[serde(rename = "distance_field.enable_caching")]
    pub enable_caching: bool,

    /// Default blend function name for unconfigured material pairs.
    /// Default "linear".
    #[serde(rename = "material_interaction.default_blend_type")]
    pub default_blend_type: String,

    /// Default material priority. Default 0.
    #[serde(rename = "material_interaction.default_priority")]
    pub default_priority: u8,

    /// Whether material-model edits are replicated. Default false.
    #[serde(rename = "material_interaction.network_synchronized")]
    pub material_network_synchronized: bool,

    /// Accepted for host compatibility; the core evaluator is CPU-only.
    #[serde(rename = "hardware.enable_gpu_acceleration")]
    pub enable_gpu_acceleration: bool,

    /// Worker threads for batch field evaluation. Default: logical cores.
    #[serde(rename = "hardware.max_threads_for_field_evaluation")]
    pub max_eval_threads: usize,

    /// Whether this participant is the authoritative server. Default true.
    #[serde(rename = "network.is_server")]
    pub is_server: bool,

    /// Conflict resolution strategy index (0..=3). Default 0 (server-wins).
    #[serde(rename = "network.conflict_resolution_strategy")]
    pub conflict_resolution_strategy: u8,

    /// Upper bound on live SDF fields. Default 65536.
    #[serde(rename = "svo.material.max_fields")]
    pub max_fields: u32,

    /// Narrow-band memory budget in MiB. Default 256.
    #[serde(rename = "svo.material.max_memory_mb")]
    pub max_memory_mb: u32,
}

impl Default for VolumeConfig {
    fn default() -> VolumeConfig {
        VolumeConfig {
            world_dimensions: [64, 64, 64],
            leaf_node_size: 1.0,
            max_depth: 6,
            material_count: 4,
            evaluation_accuracy: 1e-3,
            max_cache_size: 65536,
            enable_caching: true,
            default_blend_type: "linear".to_string(),
            default_priority: 0,
            material_network_synchronized: false,
            enable_gpu_acceleration: false,
            max_eval_threads: num_cpus::get(),
            is_server: true,
            conflict_resolution_strategy: 0,
            max_fields: 65536,
            max_memory_mb: 256,
        }
    }
}

impl VolumeConfig {
    /// Parses the host's flat key/value object. Unknown keys are ignored so
    /// hosts can share one config blob across subsystems.
    pub fn from_json(json: &str) -> VolumeResult<VolumeConfig> {
        let config: VolumeConfig =
            serde_json::from_str(json).map_err(|e| VolumeError::invalid(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> VolumeResult<()> {
        if self.material_count == 0 || self.material_count > 256 {
            return Err(VolumeError::invalid(format!(
                "material_count {} outside 1..=256",
                self.material_count
            )));
        }
        if self.max_depth == 0 || self.max_depth > 10 {
            return Err(VolumeError::invalid(format!(
                "max_depth {} outside 1..=10",
                self.max_depth
            )));
        }
        if self.leaf_node_size <= 0.0 {
            return Err(VolumeError::invalid("leaf_node_size must be positive"));
        }
        if self.world_dimensions.iter().any(|&d| d == 0) {
            return Err(VolumeError::invalid("world_dimensions must be non-zero"));
        }
        if self.conflict_resolution_strategy > 3 {
            return Err(VolumeError::invalid(format!(
                "conflict_resolution_strategy {} outside 0..=3",
                self.conflict_resolution_strategy
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::VolumeConfig;

    #[test]
    fn config_defaults() {
        let config = VolumeConfig::from_json("{}").unwrap();
        assert_eq!(config, VolumeConfig::default());
        assert_eq!(config.max_depth, 6);
        assert_eq!(config.world_dimensions, [64, 64, 64]);
    }

    #[test]
    fn config_overrides_and_unknown_keys() {
        let config = VolumeConfig::from_json(
            r#"{
                "volume.max_depth": 8,
                "volume.material_count": 16,
                "network.is_server": false,
                "renderer.some_unrelated_key": true
            }"#,
        )
        .unwrap();
        assert_eq!(config.max_depth, 8);
        assert_eq!(config.material_count, 16);
        assert!(!config.is_server);
        assert_eq!(config.leaf_node_size, 1.0);
    }

    #[test]
    fn config_rejects_out_of_range() {
        assert!(VolumeConfig::from_json(r#"{"volume.material_count": 0}"#).is_err());
        assert!(VolumeConfig::from_json(r#"{"volume.material_count": 300}"#).is_err());
        assert!(VolumeConfig::from_json(r#"{"network.conflict_resolution_strategy": 7}"#).is_err());
    }
}
