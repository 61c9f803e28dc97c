use crate::PylonConfig;

/// Validation output for a loaded proxy configuration.
#[derive(Debug, Default)]
pub struct ConfigReport {
    warnings: Vec<String>,
    errors: Vec<String>,
}

impl ConfigReport {
    /// Returns true when no errors were found.
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns true when at least one error was found.
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Returns the collected warning messages.
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    /// Returns the collected error messages.
    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    /// Render warnings and errors into a readable, multi-line string.
    pub fn format(&self) -> String {
        let mut out = String::new();
        if !self.errors.is_empty() {
            out.push_str("Errors:\n");
            for err in &self.errors {
                out.push_str("  - ");
                out.push_str(err);
                out.push('\n');
            }
        }
        if !self.warnings.is_empty() {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str("Warnings:\n");
            for warn in &self.warnings {
                out.push_str("  - ");
                out.push_str(warn);
                out.push('\n');
            }
        }
        out
    }

    fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    fn error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }
}

/// Validate a proxy configuration and return a report of issues.
pub fn validate(cfg: &PylonConfig) -> ConfigReport {
    let mut report = ConfigReport::default();

    validate_listen(cfg, &mut report);
    validate_workers(cfg, &mut report);
    validate_upstreams(cfg, &mut report);
    validate_timeouts(cfg, &mut report);
    validate_limits(cfg, &mut report);

    report
}

fn validate_listen(cfg: &PylonConfig, report: &mut ConfigReport) {
    check_endpoint("listen", &cfg.listen, report);

    if let Some(metrics_listen) = cfg.metrics_listen.as_deref() {
        check_endpoint("metrics_listen", metrics_listen, report);
    }
}

fn check_endpoint(field: &str, value: &str, report: &mut ConfigReport) {
    if value.matches(':').count() != 1 {
        report.error(format!(
            "'{field}' must be \"host:port\" with exactly one colon, got '{value}'"
        ));
        return;
    }

    let (host, port) = value.split_once(':').unwrap_or(("", ""));
    if host.is_empty() {
        report.error(format!("'{field}' has an empty host part"));
    }
    if port.parse::<u16>().is_err() {
        report.error(format!("'{field}' port '{port}' is not a valid port number"));
    }
}

fn validate_workers(cfg: &PylonConfig, report: &mut ConfigReport) {
    if cfg.workers == 0 {
        report.error("'workers' must be at least 1");
    }
}

fn validate_upstreams(cfg: &PylonConfig, report: &mut ConfigReport) {
    if cfg.upstreams.is_empty() {
        report.error("'upstreams' must contain at least one entry");
    }

    for (idx, upstream) in cfg.upstreams.iter().enumerate() {
        if upstream.host.trim().is_empty() {
            report.error(format!("upstream entry at index {idx} has an empty host"));
        }
        if upstream.port == 0 {
            report.error(format!("upstream entry at index {idx} has port 0"));
        }
    }
}

fn validate_timeouts(cfg: &PylonConfig, report: &mut ConfigReport) {
    for (name, value) in [
        ("connect_ms", cfg.timeouts.connect_ms),
        ("read_ms", cfg.timeouts.read_ms),
        ("write_ms", cfg.timeouts.write_ms),
        ("total_ms", cfg.timeouts.total_ms),
    ] {
        if value <= 0.0 {
            report.warn(format!(
                "timeouts.{name} is {value}; all I/O on that path will time out immediately"
            ));
        }
    }
}

fn validate_limits(cfg: &PylonConfig, report: &mut ConfigReport) {
    if cfg.limits.max_client_conns == 0 {
        report.error("limits.max_client_conns must be at least 1");
    }
    if cfg.limits.max_conns_per_upstream == 0 {
        report.error("limits.max_conns_per_upstream must be at least 1");
    }
}
