pub fn idle_timeout_seconds() -> u32 {
    180
}
pub fn suppress_timeout_ms() -> u32 {
    1000
}
pub fn alarms() -> Vec<super::file_config::AlarmConfig> {
    vec![super::file_config::AlarmConfig {
        id: 1,
        timeout_seconds: idle_timeout_seconds(),
    }]
}
