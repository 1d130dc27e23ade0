//! Rendering of the systemd unit handed to the remote service manager

use crate::config::DeployConfig;

/// Text of the `.service` unit for the supervised strategy. `exec_start`
/// comes from whichever backend the activator settled on.
pub fn render_unit(cfg: &DeployConfig, exec_start: &str) -> String {
    format!(
        r#"[Unit]
Description={name} static site (port {port})
After=network.target

[Service]
Type=simple
User={user}
WorkingDirectory={workdir}
ExecStart={exec_start}
Restart=always
RestartSec=3

[Install]
WantedBy=multi-user.target
"#,
        name = cfg.service_unit_name(),
        port = cfg.web_port,
        user = cfg.username,
        workdir = cfg.remote_root,
    )
}
