//! 适配器配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `FLEET__*` 覆盖（双下划线表示嵌套，如 `FLEET__FLEET__NAME=tinyRobot`）。

use std::path::PathBuf;

use serde::Deserialize;

use crate::traffic::VehicleTraits;

/// 配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AdapterConfig {
    pub fleet: FleetSection,
    pub traits: TraitsSection,
    pub driver: DriverSection,
    pub motion: MotionSection,
    pub negotiation: NegotiationSection,
    pub devices: DevicesSection,
}

/// [fleet] 段：车队名与导航图文件
#[derive(Debug, Clone, Deserialize)]
pub struct FleetSection {
    #[serde(default = "default_fleet_name")]
    pub name: String,
    /// 导航图文件（.json 或 .toml）
    pub nav_graph_file: Option<PathBuf>,
}

fn default_fleet_name() -> String {
    "fleet".to_string()
}

impl Default for FleetSection {
    fn default() -> Self {
        Self {
            name: default_fleet_name(),
            nav_graph_file: None,
        }
    }
}

/// [traits] 段：车辆运动参数
#[derive(Debug, Clone, Deserialize)]
pub struct TraitsSection {
    #[serde(default = "default_linear_velocity")]
    pub linear_velocity: f64,
    #[serde(default = "default_linear_acceleration")]
    pub linear_acceleration: f64,
    #[serde(default = "default_angular_velocity")]
    pub angular_velocity: f64,
    #[serde(default = "default_angular_acceleration")]
    pub angular_acceleration: f64,
}

fn default_linear_velocity() -> f64 {
    0.7
}

fn default_linear_acceleration() -> f64 {
    0.3
}

fn default_angular_velocity() -> f64 {
    0.5
}

fn default_angular_acceleration() -> f64 {
    1.5
}

impl Default for TraitsSection {
    fn default() -> Self {
        Self {
            linear_velocity: default_linear_velocity(),
            linear_acceleration: default_linear_acceleration(),
            angular_velocity: default_angular_velocity(),
            angular_acceleration: default_angular_acceleration(),
        }
    }
}

impl TraitsSection {
    pub fn vehicle_traits(&self) -> VehicleTraits {
        VehicleTraits {
            linear_velocity: self.linear_velocity,
            linear_acceleration: self.linear_acceleration,
            angular_velocity: self.angular_velocity,
            angular_acceleration: self.angular_acceleration,
        }
    }
}

/// [driver] 段：命令重发、停靠期间的调度刷新与接入阈值
#[derive(Debug, Clone, Deserialize)]
pub struct DriverSection {
    /// 驱动未确认命令时的重发间隔（毫秒）
    #[serde(default = "default_command_resend_ms")]
    pub command_resend_ms: u64,
    #[serde(default = "default_dock_schedule_refresh_ms")]
    pub dock_schedule_refresh_ms: u64,
    #[serde(default = "default_max_merge_waypoint_distance")]
    pub max_merge_waypoint_distance: f64,
    #[serde(default = "default_max_merge_lane_distance")]
    pub max_merge_lane_distance: f64,
    /// 到达时与目标路点的允许偏差（米），超出只告警
    #[serde(default = "default_finish_tolerance")]
    pub finish_tolerance: f64,
}

fn default_command_resend_ms() -> u64 {
    200
}

fn default_dock_schedule_refresh_ms() -> u64 {
    1000
}

fn default_max_merge_waypoint_distance() -> f64 {
    0.1
}

fn default_max_merge_lane_distance() -> f64 {
    1.0
}

fn default_finish_tolerance() -> f64 {
    2.0
}

impl Default for DriverSection {
    fn default() -> Self {
        Self {
            command_resend_ms: default_command_resend_ms(),
            dock_schedule_refresh_ms: default_dock_schedule_refresh_ms(),
            max_merge_waypoint_distance: default_max_merge_waypoint_distance(),
            max_merge_lane_distance: default_max_merge_lane_distance(),
            finish_tolerance: default_finish_tolerance(),
        }
    }
}

/// [motion] 段：MoveRobot 的失活超时、延迟阈值与尾段保活
#[derive(Debug, Clone, Deserialize)]
pub struct MotionSection {
    #[serde(default = "default_update_timeout_secs")]
    pub update_timeout_secs: u64,
    #[serde(default = "default_delay_min_change_ms")]
    pub delay_min_change_ms: u64,
    /// 未设置时不做尾段保活
    pub tail_period_ms: Option<u64>,
}

fn default_update_timeout_secs() -> u64 {
    10
}

fn default_delay_min_change_ms() -> u64 {
    100
}

impl Default for MotionSection {
    fn default() -> Self {
        Self {
            update_timeout_secs: default_update_timeout_secs(),
            delay_min_change_ms: default_delay_min_change_ms(),
            tail_period_ms: None,
        }
    }
}

/// [negotiation] 段：方案代价容忍度
#[derive(Debug, Clone, Deserialize)]
pub struct NegotiationSection {
    #[serde(default = "default_compliant_leeway_base")]
    pub compliant_leeway_base: f64,
    #[serde(default = "default_compliant_leeway_multiplier")]
    pub compliant_leeway_multiplier: f64,
    #[serde(default = "default_max_cost_threshold")]
    pub max_cost_threshold: f64,
}

fn default_compliant_leeway_base() -> f64 {
    2.0
}

fn default_compliant_leeway_multiplier() -> f64 {
    3.0
}

fn default_max_cost_threshold() -> f64 {
    200.0
}

impl Default for NegotiationSection {
    fn default() -> Self {
        Self {
            compliant_leeway_base: default_compliant_leeway_base(),
            compliant_leeway_multiplier: default_compliant_leeway_multiplier(),
            max_cost_threshold: default_max_cost_threshold(),
        }
    }
}

/// [devices] 段：门与电梯请求的重发间隔
#[derive(Debug, Clone, Deserialize)]
pub struct DevicesSection {
    #[serde(default = "default_request_retry_ms")]
    pub request_retry_ms: u64,
}

fn default_request_retry_ms() -> u64 {
    1000
}

impl Default for DevicesSection {
    fn default() -> Self {
        Self {
            request_retry_ms: default_request_retry_ms(),
        }
    }
}

/// 从 config 目录加载配置，环境变量 FLEET__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 FLEET__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AdapterConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("FLEET")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

/// 重新从磁盘与环境变量加载配置
pub fn reload_config() -> Result<AdapterConfig, config::ConfigError> {
    load_config(None)
}
