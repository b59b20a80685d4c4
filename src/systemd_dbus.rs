// The systemd D-Bus connection (spec.md §6 "Outbound sockets": system bus
// for root, user bus for rootless). `SystemdConn` fixes the interface the
// Systemd and Quadlet executors need (spec.md §4.8); the manager object
// path and interface names follow systemd's stable D-Bus API, reached via
// `zbus` the way the rest of this crate reaches git/Podman over their own
// wire protocols.

use async_trait::async_trait;
use zbus::Connection;

const MANAGER_DEST: &str = "org.freedesktop.systemd1";
const MANAGER_PATH: &str = "/org/freedesktop/systemd1";
const MANAGER_IFACE: &str = "org.freedesktop.systemd1.Manager";

/// The systemd surface the Systemd/Quadlet executors need (spec.md §6).
/// One connection is opened for the life of the process and shared by
/// every tick (spec.md §5).
#[async_trait]
pub trait SystemdConn: Send + Sync {
    /// `systemctl daemon-reload` (spec.md §4.8 Quadlet: "after all files in
    /// the batch are placed, invoke `systemctl daemon-reload` once").
    async fn daemon_reload(&self) -> anyhow::Result<()>;

    /// Enable (and optionally persist) a unit by file name, e.g.
    /// `web.service` (spec.md §4.8 Systemd/Quadlet: "enable+start on
    /// create").
    async fn enable_unit(&self, unit: &str) -> anyhow::Result<()>;

    async fn start_unit(&self, unit: &str) -> anyhow::Result<()>;

    async fn restart_unit(&self, unit: &str) -> anyhow::Result<()>;

    async fn stop_unit(&self, unit: &str) -> anyhow::Result<()>;

    /// True once systemd has generated a unit for `unit` (spec.md §4.8
    /// Quadlet: "verify generated service exists" before touching it).
    async fn unit_exists(&self, unit: &str) -> anyhow::Result<bool>;
}

/// Connects to the system bus when `root` is true, the user (session) bus
/// otherwise (spec.md §6).
pub struct SystemdClient {
    conn: Connection,
}

impl SystemdClient {
    pub async fn connect(root: bool) -> anyhow::Result<Self> {
        let conn = if root {
            Connection::system().await
        } else {
            Connection::session().await
        }?;
        Ok(Self { conn })
    }

    async fn manager(&self) -> zbus::Result<zbus::Proxy<'_>> {
        zbus::Proxy::new(&self.conn, MANAGER_DEST, MANAGER_PATH, MANAGER_IFACE).await
    }
}

impl std::fmt::Debug for SystemdClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemdClient").finish_non_exhaustive()
    }
}

#[async_trait]
impl SystemdConn for SystemdClient {
    async fn daemon_reload(&self) -> anyhow::Result<()> {
        self.manager().await?.call_method("Reload", &()).await?;
        Ok(())
    }

    async fn enable_unit(&self, unit: &str) -> anyhow::Result<()> {
        let manager = self.manager().await?;
        let units = vec![unit.to_owned()];
        manager
            .call_method("EnableUnitFiles", &(units, false, true))
            .await?;
        Ok(())
    }

    async fn start_unit(&self, unit: &str) -> anyhow::Result<()> {
        self.manager()
            .await?
            .call_method("StartUnit", &(unit, "replace"))
            .await?;
        Ok(())
    }

    async fn restart_unit(&self, unit: &str) -> anyhow::Result<()> {
        self.manager()
            .await?
            .call_method("RestartUnit", &(unit, "replace"))
            .await?;
        Ok(())
    }

    async fn stop_unit(&self, unit: &str) -> anyhow::Result<()> {
        self.manager()
            .await?
            .call_method("StopUnit", &(unit, "replace"))
            .await?;
        Ok(())
    }

    async fn unit_exists(&self, unit: &str) -> anyhow::Result<bool> {
        let manager = self.manager().await?;
        let reply: zbus::Result<zbus::zvariant::OwnedObjectPath> =
            manager.call_method("GetUnit", &(unit,)).await.and_then(|m| m.body());
        Ok(reply.is_ok())
    }
}

#[cfg(test)]
pub mod test_utils {
    use std::sync::Mutex;

    use super::*;

    /// Records every call for assertions without a real bus connection
    /// (spec.md §8 idempotent-tick property tests don't exercise systemd
    /// itself).
    #[derive(Debug, Default)]
    pub struct NoopSystemd {
        pub calls: Mutex<Vec<String>>,
        pub existing_units: Mutex<std::collections::HashSet<String>>,
    }

    #[async_trait]
    impl SystemdConn for NoopSystemd {
        async fn daemon_reload(&self) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push("daemon_reload".to_owned());
            Ok(())
        }

        async fn enable_unit(&self, unit: &str) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push(format!("enable_unit({unit})"));
            self.existing_units.lock().unwrap().insert(unit.to_owned());
            Ok(())
        }

        async fn start_unit(&self, unit: &str) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push(format!("start_unit({unit})"));
            Ok(())
        }

        async fn restart_unit(&self, unit: &str) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push(format!("restart_unit({unit})"));
            Ok(())
        }

        async fn stop_unit(&self, unit: &str) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push(format!("stop_unit({unit})"));
            Ok(())
        }

        async fn unit_exists(&self, _unit: &str) -> anyhow::Result<bool> {
            Ok(true)
        }
    }
}
