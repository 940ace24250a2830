use serde::Deserialize;
use std::{collections::HashMap, ffi::OsString, fs, path::{Path, PathBuf}, time::Duration};

use crate::error::ConfigError;

fn default_max_wait_time_interval() -> f64 { 60.0 }
fn default_max_restarts() -> i64 { 5 }
fn default_max_retries() -> i64 { -1 }
fn default_wait() -> f64 { 1.0 }
fn default_grow() -> f64 { 0.25 }
fn default_watch_interval() -> f64 { 0.5 }
fn default_stop_timeout() -> f64 { 5.0 }
fn default_log_level() -> String { String::from("info") }


/// Seconds as a [`Duration`], saturating instead of panicking on values
/// [`SupervisorConfig::validated`] would have rejected.
pub(crate) fn duration_secs(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs.max(0.0)).unwrap_or(Duration::MAX)
}

/// Clamps `secs` to zero or more and checks it converts to a [`Duration`].
fn checked_secs(field: &'static str, secs: f64) -> Result<f64, ConfigError> {
    if !secs.is_finite() {
        return Err(ConfigError::NotFinite(field));
    }
    let secs = secs.max(0.0);
    Duration::try_from_secs_f64(secs).map_err(|_| ConfigError::OutOfRange(field))?;
    Ok(secs)
}


/// Everything the supervisor needs to know about the script it keeps alive.
///
/// Time values are seconds and may be fractional. Build one with
/// [`SupervisorConfig::new`] or deserialize it from YAML, then pass it through
/// [`SupervisorConfig::validated`] (the builder does this for you).
#[derive(Debug, Deserialize, Clone)]
pub struct SupervisorConfig {
    pub script: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    /// Program used to run the script, e.g. `/bin/sh`. The script is executed directly when unset.
    #[serde(default)]
    pub interpreter: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub working_directory: Option<PathBuf>,
    #[serde(default = "default_max_wait_time_interval")]
    pub max_wait_time_interval: f64,
    #[serde(default = "default_max_restarts")]
    pub max_restarts: i64,
    /// Negative means unlimited.
    #[serde(default = "default_max_retries")]
    pub max_retries: i64,
    #[serde(default = "default_wait")]
    pub wait: f64,
    #[serde(default = "default_grow")]
    pub grow: f64,
    #[serde(default)]
    pub abort_on_error: bool,
    #[serde(default)]
    pub restart_on_script_change: bool,
    /// 0 binds an ephemeral port.
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub socket_timeout: Option<f64>,
    #[serde(default = "default_watch_interval")]
    pub watch_interval: f64,
    /// How long a child must stay up before attempts and wait are reset. 0 resets on spawn.
    #[serde(default)]
    pub reset_after: f64,
    /// Grace period between SIGTERM and SIGKILL when the supervisor kills the child.
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout: f64,
}

impl SupervisorConfig {
    pub fn new(script: impl Into<PathBuf>) -> Self {
        Self {
            script: script.into(),
            args: Vec::new(),
            interpreter: None,
            env: HashMap::new(),
            working_directory: None,
            max_wait_time_interval: default_max_wait_time_interval(),
            max_restarts: default_max_restarts(),
            max_retries: default_max_retries(),
            wait: default_wait(),
            grow: default_grow(),
            abort_on_error: false,
            restart_on_script_change: false,
            port: 0,
            socket_timeout: None,
            watch_interval: default_watch_interval(),
            reset_after: 0.0,
            stop_timeout: default_stop_timeout(),
        }
    }

    /// Checks the script path, clamps every negative tunable to zero and makes
    /// sure every time value fits in a [`Duration`].
    pub fn validated(mut self) -> Result<Self, ConfigError> {
        if !self.script.is_absolute() {
            return Err(ConfigError::RelativeScript(self.script));
        }

        if !self.grow.is_finite() {
            return Err(ConfigError::NotFinite("grow"));
        }
        self.grow = self.grow.max(0.0);

        let secs = [
            ("max_wait_time_interval", &mut self.max_wait_time_interval),
            ("wait", &mut self.wait),
            ("watch_interval", &mut self.watch_interval),
            ("reset_after", &mut self.reset_after),
            ("stop_timeout", &mut self.stop_timeout),
        ];
        for (field, value) in secs {
            *value = checked_secs(field, *value)?;
        }
        if let Some(timeout) = self.socket_timeout.as_mut() {
            *timeout = checked_secs("socket_timeout", *timeout)?;
        }

        self.max_restarts = self.max_restarts.max(0);
        self.max_retries = self.max_retries.max(-1);
        Ok(self)
    }

    /// File name of the script, used in log lines.
    pub fn script_name(&self) -> String {
        self.script
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.script.display().to_string())
    }

    /// Explicit working directory, else the directory holding the script.
    pub fn cwd(&self) -> PathBuf {
        match &self.working_directory {
            Some(dir) => dir.clone(),
            None => self
                .script
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("/")),
        }
    }

    /// The child's environment: ours, overlaid with `env`. Inherited values
    /// need not be UTF-8.
    pub fn child_env(&self) -> HashMap<OsString, OsString> {
        let mut merged: HashMap<OsString, OsString> = std::env::vars_os().collect();
        merged.extend(self.env.iter().map(|(k, v)| (OsString::from(k), OsString::from(v))));
        merged
    }

    pub fn max_retries(&self) -> Option<u32> {
        u32::try_from(self.max_retries).ok()
    }

    pub fn socket_timeout(&self) -> Option<Duration> {
        self.socket_timeout
            .filter(|secs| *secs > 0.0)
            .map(duration_secs)
    }

    pub fn watch_interval(&self) -> Duration {
        duration_secs(self.watch_interval).max(Duration::from_millis(10))
    }

    pub fn reset_after(&self) -> Duration {
        duration_secs(self.reset_after)
    }

    pub fn stop_timeout(&self) -> Duration {
        duration_secs(self.stop_timeout)
    }
}


/// Config file for the binary: the supervisor block plus where and how to log.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(flatten)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub console: bool,
}



/*
    @@@
    @parser();
    . Reads the content of the YAML file into a String. Any I/O error (file not found, permission denied, etc.) is returned as ConfigError::Read.
    . Hands the raw YAML text to serde_yaml, then validates/clamps the supervisor block once.
*/
pub fn parser(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let yaml_file = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let mut parsed_config: Config = serde_yaml::from_str(&yaml_file)?;
    parsed_config.supervisor = parsed_config.supervisor.validated()?;
    Ok(parsed_config)
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg: Config = serde_yaml::from_str("script: /srv/app/run.sh\n").unwrap();
        let sup = cfg.supervisor.validated().unwrap();
        assert_eq!(sup.max_wait_time_interval, 60.0);
        assert_eq!(sup.max_restarts, 5);
        assert_eq!(sup.max_retries(), None);
        assert_eq!(sup.wait, 1.0);
        assert_eq!(sup.grow, 0.25);
        assert!(!sup.abort_on_error);
        assert!(!sup.restart_on_script_change);
        assert_eq!(cfg.log_level, "info");
        assert!(!cfg.console);
    }

    #[test]
    fn negative_values_are_clamped() {
        let mut cfg = SupervisorConfig::new("/srv/app/run.sh");
        cfg.wait = -3.0;
        cfg.grow = -1.0;
        cfg.max_restarts = -7;
        cfg.max_wait_time_interval = -60.0;
        cfg.max_retries = -20;
        let cfg = cfg.validated().unwrap();
        assert_eq!(cfg.wait, 0.0);
        assert_eq!(cfg.grow, 0.0);
        assert_eq!(cfg.max_restarts, 0);
        assert_eq!(cfg.max_wait_time_interval, 0.0);
        assert_eq!(cfg.max_retries, -1);
    }

    #[test]
    fn relative_script_is_rejected() {
        let err = SupervisorConfig::new("run.sh").validated().unwrap_err();
        assert!(matches!(err, ConfigError::RelativeScript(_)));
    }

    #[test]
    fn nan_is_rejected() {
        let mut cfg = SupervisorConfig::new("/srv/app/run.sh");
        cfg.wait = f64::NAN;
        assert!(matches!(cfg.validated(), Err(ConfigError::NotFinite("wait"))));
    }

    #[test]
    fn huge_durations_are_rejected() {
        let mut cfg = SupervisorConfig::new("/srv/app/run.sh");
        cfg.max_wait_time_interval = 1e20;
        assert!(matches!(
            cfg.validated(),
            Err(ConfigError::OutOfRange("max_wait_time_interval"))
        ));

        let mut cfg = SupervisorConfig::new("/srv/app/run.sh");
        cfg.socket_timeout = Some(f64::MAX);
        assert!(matches!(cfg.validated(), Err(ConfigError::OutOfRange("socket_timeout"))));

        let mut cfg = SupervisorConfig::new("/srv/app/run.sh");
        cfg.grow = 1e20;
        assert!(cfg.validated().is_ok());
    }

    #[test]
    fn non_utf8_environment_is_carried_over() {
        use std::os::unix::ffi::OsStrExt;
        let key = std::ffi::OsStr::from_bytes(b"SCRIPT_SUPERVISOR_RAW_BYTES");
        let value = std::ffi::OsStr::from_bytes(&[0xff, 0xfe]);
        std::env::set_var(key, value);
        let env = SupervisorConfig::new("/srv/app/run.sh").child_env();
        assert_eq!(env[key].as_os_str(), value);
    }

    #[test]
    fn cwd_defaults_to_script_dir() {
        let mut cfg = SupervisorConfig::new("/srv/app/run.sh");
        assert_eq!(cfg.cwd(), PathBuf::from("/srv/app"));
        cfg.working_directory = Some(PathBuf::from("/tmp"));
        assert_eq!(cfg.cwd(), PathBuf::from("/tmp"));
    }

    #[test]
    fn env_overrides_inherited_keys() {
        std::env::set_var("SCRIPT_SUPERVISOR_PARSE_TEST", "outer");
        let mut cfg = SupervisorConfig::new("/srv/app/run.sh");
        cfg.env.insert("SCRIPT_SUPERVISOR_PARSE_TEST".into(), "inner".into());
        let env = cfg.child_env();
        assert_eq!(env[&OsString::from("SCRIPT_SUPERVISOR_PARSE_TEST")], "inner");
        assert_eq!(std::env::var("SCRIPT_SUPERVISOR_PARSE_TEST").unwrap(), "outer");
    }

    #[test]
    fn full_yaml_file() {
        let yaml = r#"
script: /srv/app/run.sh
interpreter: /bin/sh
args: ["--verbose"]
env:
  MODE: test
max_restarts: 3
max_retries: 2
wait: 0.5
grow: 1.0
abort_on_error: true
restart_on_script_change: true
port: 4500
socket_timeout: 30
log_dir: /var/log/app
console: true
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        let sup = cfg.supervisor.validated().unwrap();
        assert_eq!(sup.interpreter.as_deref(), Some("/bin/sh"));
        assert_eq!(sup.args, vec!["--verbose".to_string()]);
        assert_eq!(sup.env["MODE"], "test");
        assert_eq!(sup.max_retries(), Some(2));
        assert_eq!(sup.port, 4500);
        assert_eq!(sup.socket_timeout(), Some(Duration::from_secs(30)));
        assert!(sup.abort_on_error);
        assert_eq!(cfg.log_dir, Some(PathBuf::from("/var/log/app")));
        assert!(cfg.console);
    }

    #[test]
    fn sample_config_parses() {
        let cfg = parser(concat!(env!("CARGO_MANIFEST_DIR"), "/config/config.yml")).unwrap();
        assert_eq!(cfg.supervisor.script_name(), "run.sh");
        assert_eq!(cfg.supervisor.max_retries(), None);
        assert_eq!(cfg.supervisor.socket_timeout(), Some(Duration::from_secs(300)));
        assert_eq!(cfg.log_level, "info");
    }

    #[test]
    fn missing_file_reports_path() {
        let err = parser("/nonexistent/supervisor.yml").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
        assert!(err.to_string().contains("/nonexistent/supervisor.yml"));
    }
}
