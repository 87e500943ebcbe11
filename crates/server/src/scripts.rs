//! Quick enroll and remove scripts served to operators.
//!
//! Templates use `{name}` placeholders filled from the environment.

use fleet_metadata::models::EnvironmentRow;

/// Kind of quick script.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScriptKind {
    EnrollShell,
    EnrollPowershell,
    RemoveShell,
    RemovePowershell,
}

impl ScriptKind {
    /// Parse from the requested file name.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "enroll.sh" => Some(Self::EnrollShell),
            "enroll.ps1" => Some(Self::EnrollPowershell),
            "remove.sh" => Some(Self::RemoveShell),
            "remove.ps1" => Some(Self::RemovePowershell),
            _ => None,
        }
    }

    /// Whether the script is guarded by the enroll secret path rather than
    /// the remove secret path.
    pub fn is_enroll(&self) -> bool {
        matches!(self, Self::EnrollShell | Self::EnrollPowershell)
    }

    fn template(&self) -> &'static str {
        match self {
            Self::EnrollShell => ENROLL_SH,
            Self::EnrollPowershell => ENROLL_PS1,
            Self::RemoveShell => REMOVE_SH,
            Self::RemovePowershell => REMOVE_PS1,
        }
    }
}

/// Render a script for `env`.
pub fn render(kind: ScriptKind, env: &EnvironmentRow) -> String {
    kind.template()
        .replace("{environment}", &env.name)
        .replace("{env_id}", &env.env_id.to_string())
        .replace("{hostname}", &env.hostname)
        .replace("{secret}", &env.secret)
}

const ENROLL_SH: &str = r#"#!/bin/sh
# Enroll this host into environment {environment}.
set -e

_SECRET="{secret}"
_HOST="{hostname}"
_ENV="{env_id}"

case "$(uname | tr '[:upper:]' '[:lower:]')" in
  darwin) _DIR=/private/var/osquery ;;
  freebsd) _DIR=/usr/local/etc ;;
  *) _DIR=/etc/osquery ;;
esac

echo "[+] Writing enroll secret"
echo "$_SECRET" | sudo tee "$_DIR/{environment}.secret" >/dev/null
sudo chmod 600 "$_DIR/{environment}.secret"

echo "[+] Writing flags"
sudo tee "$_DIR/osquery.flags" >/dev/null <<EOF
--host_identifier=uuid
--enroll_secret_path=$_DIR/{environment}.secret
--tls_hostname=$_HOST
--enroll_tls_endpoint=/$_ENV/enroll
--config_plugin=tls
--config_tls_endpoint=/$_ENV/config
--logger_plugin=tls
--logger_tls_endpoint=/$_ENV/log
--logger_tls_compress=true
--disable_distributed=false
--distributed_plugin=tls
--distributed_tls_read_endpoint=/$_ENV/read
--distributed_tls_write_endpoint=/$_ENV/write
--disable_carver=false
--carver_start_endpoint=/$_ENV/init
--carver_continue_endpoint=/$_ENV/block
EOF

echo "[+] Restarting osqueryd"
if command -v systemctl >/dev/null; then
  sudo systemctl restart osqueryd
elif command -v launchctl >/dev/null; then
  sudo launchctl kickstart -k system/io.osquery.agent
else
  sudo service osqueryd restart
fi
"#;

const ENROLL_PS1: &str = r#"# Enroll this host into environment {environment}.
$ErrorActionPreference = "Stop"

$secret = "{secret}"
$hostname = "{hostname}"
$env = "{env_id}"
$dir = "C:\Program Files\osquery"

Write-Host "[+] Writing enroll secret"
Set-Content -Path "$dir\{environment}.secret" -Value $secret

Write-Host "[+] Writing flags"
@"
--host_identifier=uuid
--enroll_secret_path=$dir\{environment}.secret
--tls_hostname=$hostname
--enroll_tls_endpoint=/$env/enroll
--config_plugin=tls
--config_tls_endpoint=/$env/config
--logger_plugin=tls
--logger_tls_endpoint=/$env/log
--logger_tls_compress=true
--disable_distributed=false
--distributed_plugin=tls
--distributed_tls_read_endpoint=/$env/read
--distributed_tls_write_endpoint=/$env/write
--disable_carver=false
--carver_start_endpoint=/$env/init
--carver_continue_endpoint=/$env/block
"@ | Set-Content -Path "$dir\osquery.flags"

Write-Host "[+] Restarting osqueryd"
Restart-Service osqueryd
"#;

const REMOVE_SH: &str = r#"#!/bin/sh
# Remove this host from environment {environment}.
set -e

case "$(uname | tr '[:upper:]' '[:lower:]')" in
  darwin) _DIR=/private/var/osquery ;;
  freebsd) _DIR=/usr/local/etc ;;
  *) _DIR=/etc/osquery ;;
esac

echo "[+] Stopping osqueryd"
if command -v systemctl >/dev/null; then
  sudo systemctl stop osqueryd
elif command -v launchctl >/dev/null; then
  sudo launchctl bootout system/io.osquery.agent || true
else
  sudo service osqueryd stop
fi

echo "[+] Removing enrollment of {hostname}"
sudo rm -f "$_DIR/{environment}.secret" "$_DIR/osquery.flags"
"#;

const REMOVE_PS1: &str = r#"# Remove this host from environment {environment}.
$ErrorActionPreference = "Stop"
$dir = "C:\Program Files\osquery"

Write-Host "[+] Stopping osqueryd"
Stop-Service osqueryd

Write-Host "[+] Removing enrollment of {hostname}"
Remove-Item -Force -ErrorAction SilentlyContinue "$dir\{environment}.secret", "$dir\osquery.flags"
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use time::OffsetDateTime;
    use uuid::Uuid;

    fn env() -> EnvironmentRow {
        let now = OffsetDateTime::now_utc();
        EnvironmentRow {
            env_id: Uuid::from_u128(7),
            name: "prod".to_string(),
            secret: "s3cr3t".to_string(),
            enroll_secret_path: "enroll-path".to_string(),
            enroll_expire: None,
            remove_secret_path: "remove-path".to_string(),
            remove_expire: None,
            accept_enrolls: true,
            debug_http: false,
            configuration: "{}".to_string(),
            accelerate_until: None,
            accelerated_seconds: 0,
            hostname: "fleet.example.com".to_string(),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_parse_script_names() {
        assert_eq!(ScriptKind::parse("enroll.sh"), Some(ScriptKind::EnrollShell));
        assert_eq!(ScriptKind::parse("remove.ps1"), Some(ScriptKind::RemovePowershell));
        assert_eq!(ScriptKind::parse("enroll.bat"), None);
        assert!(ScriptKind::EnrollPowershell.is_enroll());
        assert!(!ScriptKind::RemoveShell.is_enroll());
    }

    #[test]
    fn test_enroll_script_embeds_environment() {
        let env = env();
        let script = render(ScriptKind::EnrollShell, &env);
        assert!(script.contains(r#"_SECRET="s3cr3t""#));
        assert!(script.contains("--tls_hostname=$_HOST"));
        assert!(script.contains(r#"_HOST="fleet.example.com""#));
        assert!(script.contains(&env.env_id.to_string()));
        assert!(!script.contains("{secret}"));
    }

    #[test]
    fn test_remove_script_has_no_secret() {
        let script = render(ScriptKind::RemovePowershell, &env());
        assert!(!script.contains("s3cr3t"));
        assert!(script.contains("prod.secret"));
    }
}
