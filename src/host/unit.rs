//! The systemd quadlet unit that runs the agentbox gateway under rootless Podman.

use anyhow::{Context, Result};
use minijinja::{AutoEscape, Environment, context};
use std::path::{Path, PathBuf};

use crate::cmd::{Cmd, MUTATE_TIMEOUT};

/// Unit directory, relative to the service user's home.
pub const UNIT_DIR: &str = ".config/containers/systemd";

pub const UNIT_FILE_NAME: &str = "agentbox.container";

/// The service systemd generates from the quadlet file.
pub const SERVICE_NAME: &str = "agentbox.service";

pub const GATEWAY_IMAGE: &str = "agentbox:local";
pub const GATEWAY_PORT: u16 = 18789;
pub const GATEWAY_COMMAND: &str = "agentbox gateway --bind 0.0.0.0 --port 18789";

/// Heredoc delimiter used when writing the unit in one shot.
const HEREDOC_MARKER: &str = "AGENTBOX_UNIT";

const UNIT_TEMPLATE: &str = r#"[Unit]
Description=agentbox gateway (rootless Podman)
Wants=network-online.target
After=network-online.target

[Container]
Image={{ image }}
ContainerName=agentbox
PublishPort=127.0.0.1:{{ port }}:{{ port }}
Volume={{ home }}/.agentbox:/home/node/.agentbox:Z
Environment=HOME=/home/node
Exec={{ command }}

[Service]
Restart=on-failure
TimeoutStartSec=300

[Install]
WantedBy=default.target
"#;

pub fn unit_dir(home: &Path) -> PathBuf {
    home.join(UNIT_DIR)
}

pub fn unit_path(home: &Path) -> PathBuf {
    unit_dir(home).join(UNIT_FILE_NAME)
}

/// Render the unit file for a user whose home is `home`.
pub fn render(home: &Path) -> Result<String> {
    let mut env = Environment::new();
    env.set_auto_escape_callback(|_| AutoEscape::None);
    env.set_keep_trailing_newline(true);
    env.render_str(
        UNIT_TEMPLATE,
        context! {
            home => home.display().to_string(),
            image => GATEWAY_IMAGE,
            port => GATEWAY_PORT,
            command => GATEWAY_COMMAND,
        },
    )
    .context("Failed to render unit template")
}

/// Builds commands that act as the unit's owner.
///
/// Commands for the invoking user run directly; anyone else goes through `sudo -u`.
#[derive(Debug, Clone)]
pub struct UnitCommands<'a> {
    pub user: &'a str,
    pub home: &'a Path,
    pub as_self: bool,
}

impl UnitCommands<'_> {
    fn as_user(&self, program: &str) -> Cmd {
        if self.as_self {
            Cmd::new(program)
        } else {
            Cmd::new("sudo").args(["-u", self.user, program])
        }
    }

    fn user_systemctl(&self, uid: &str, verb: &[&str]) -> Cmd {
        let cmd = if self.as_self {
            Cmd::new("systemctl")
        } else {
            self.as_user("env")
                .arg(format!("XDG_RUNTIME_DIR=/run/user/{}", uid))
                .arg("systemctl")
        };
        cmd.arg("--user")
            .args(verb.iter().copied())
            .timeout(MUTATE_TIMEOUT)
    }

    pub fn mkdir(&self) -> Cmd {
        self.as_user("mkdir")
            .args(["-p".to_string(), unit_dir(self.home).display().to_string()])
            .timeout(MUTATE_TIMEOUT)
    }

    /// Write `content` to the unit path with a single heredoc.
    pub fn write(&self, content: &str) -> Cmd {
        self.as_user("sh")
            .args(["-c".to_string(), heredoc_script(self.home, content)])
            .timeout(MUTATE_TIMEOUT)
    }

    pub fn daemon_reload(&self, uid: &str) -> Cmd {
        self.user_systemctl(uid, &["daemon-reload"])
    }

    pub fn enable(&self, uid: &str) -> Cmd {
        self.user_systemctl(uid, &["enable", SERVICE_NAME])
    }
}

fn heredoc_script(home: &Path, content: &str) -> String {
    format!(
        "cat > '{}' <<'{marker}'\n{}{marker}\n",
        unit_path(home).display(),
        content,
        marker = HEREDOC_MARKER
    )
}

fn user_prefix(user: &str) -> String {
    format!("sudo -u {} ", user)
}

/// Reload and enable commands for the operator to run by hand.
pub fn manual_activation(user: &str) -> Vec<String> {
    let env = format!("XDG_RUNTIME_DIR=/run/user/$(id -u {})", user);
    vec![
        format!("{}{} systemctl --user daemon-reload", user_prefix(user), env),
        format!(
            "{}{} systemctl --user enable {}",
            user_prefix(user),
            env,
            SERVICE_NAME
        ),
    ]
}

/// The full mkdir / write / reload / enable sequence as shell text.
pub fn manual_install(user: &str, home: &Path, content: &str) -> Vec<String> {
    let mut lines = vec![
        format!(
            "{}mkdir -p {}",
            user_prefix(user),
            unit_dir(home).display()
        ),
        format!(
            "{}sh -c \"cat > {}\" <<'{marker}'\n{}{marker}",
            user_prefix(user),
            unit_path(home).display(),
            content,
            marker = HEREDOC_MARKER
        ),
    ];
    lines.extend(manual_activation(user));
    lines
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_fills_home_and_fixed_values() {
        let unit = render(Path::new("/home/agentbox")).unwrap();
        for stanza in ["[Unit]", "[Container]", "[Service]", "[Install]"] {
            assert!(unit.contains(stanza), "missing {}", stanza);
        }
        assert!(unit.contains("Volume=/home/agentbox/.agentbox:/home/node/.agentbox:Z"));
        assert!(unit.contains("Image=agentbox:local"));
        assert!(unit.contains("PublishPort=127.0.0.1:18789:18789"));
        assert!(unit.ends_with("WantedBy=default.target\n"));
    }

    #[test]
    fn unit_path_is_under_home() {
        assert_eq!(
            unit_path(Path::new("/home/a")),
            PathBuf::from("/home/a/.config/containers/systemd/agentbox.container")
        );
    }

    #[test]
    fn commands_for_other_user_go_through_sudo() {
        let cmds = UnitCommands {
            user: "agentbox",
            home: Path::new("/home/agentbox"),
            as_self: false,
        };
        assert_eq!(
            cmds.mkdir().to_string(),
            "sudo -u agentbox mkdir -p /home/agentbox/.config/containers/systemd"
        );
        assert_eq!(
            cmds.daemon_reload("1001").to_string(),
            "sudo -u agentbox env XDG_RUNTIME_DIR=/run/user/1001 systemctl --user daemon-reload"
        );
        assert_eq!(
            cmds.enable("1001").to_string(),
            "sudo -u agentbox env XDG_RUNTIME_DIR=/run/user/1001 systemctl --user enable agentbox.service"
        );
    }

    #[test]
    fn commands_for_self_run_directly() {
        let cmds = UnitCommands {
            user: "me",
            home: Path::new("/home/me"),
            as_self: true,
        };
        assert_eq!(cmds.daemon_reload("1000").to_string(), "systemctl --user daemon-reload");
        let write = cmds.write("[Unit]\n");
        assert_eq!(write.program(), "sh");
        let script = &write.arg_list()[1];
        assert!(script.starts_with(
            "cat > '/home/me/.config/containers/systemd/agentbox.container' <<'AGENTBOX_UNIT'\n"
        ));
        assert!(script.ends_with("[Unit]\nAGENTBOX_UNIT\n"));
    }

    #[test]
    fn manual_install_lists_full_sequence() {
        let lines = manual_install("agentbox", Path::new("/home/agentbox"), "[Unit]\n");
        assert_eq!(lines.len(), 4);
        assert!(lines[0].contains("mkdir -p /home/agentbox/.config/containers/systemd"));
        assert!(lines[1].contains("<<'AGENTBOX_UNIT'\n[Unit]\nAGENTBOX_UNIT"));
        assert!(lines[2].ends_with("systemctl --user daemon-reload"));
        assert!(lines[3].ends_with("systemctl --user enable agentbox.service"));
    }
}
