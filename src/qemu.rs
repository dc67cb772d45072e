//! Typed QEMU launch configuration and pure command-line synthesis.
//!
//! [`QemuSystem`] models one `qemu-system-*` invocation. Synthesis is pure:
//! [`QemuSystem::args`] turns the configuration into an ordered token list
//! without touching the filesystem or spawning anything. The emission order is
//! a contract with QEMU's parser: character and block drivers must precede the
//! devices that reference them by id, boot payload flags follow device setup,
//! and debug flags come last.

use std::collections::BTreeMap;

use camino::Utf8PathBuf;
use serde::Deserialize;

/// Launch configuration for a single emulator invocation.
///
/// Every field is optional; a field that is absent (or an empty list)
/// contributes no tokens at all. The only defaulted field is `stop`, which is
/// off unless requested.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QemuSystem {
    /// Target architecture, selects the `qemu-system-{arch}` executable.
    pub architecture: Option<String>,
    /// Machine type, e.g. `q35`.
    pub machine: Option<String>,
    /// CPU model, e.g. `max`.
    pub cpu: Option<String>,
    /// Acceleration backends, tried in order, e.g. `kvm`, `tcg`.
    pub accelerators: Vec<String>,
    /// Character device backends (`-chardev`), declared before any `-device`
    /// that references them.
    pub character_drivers: Vec<String>,
    /// Block device backends (`-blockdev`).
    pub block_drivers: Vec<String>,
    /// Debug console backend (`-debugcon`).
    pub debug_console: Option<String>,
    /// Virtual devices (`-device`).
    pub devices: Vec<String>,
    /// Display frontend (`-display`).
    pub display: Option<String>,
    /// Drive definitions (`-drive`).
    pub drives: Vec<String>,
    /// Real-time clock setup (`-rtc`).
    pub rtc: Option<String>,
    /// Firmware payload (`-bios`).
    pub bios: Option<Utf8PathBuf>,
    /// Multiboot payload (`-kernel`).
    pub kernel: Option<Utf8PathBuf>,
    /// Debug log item mask (`-d`).
    pub debug: Option<String>,
    /// Debug log output file (`-D`).
    pub debug_file: Option<Utf8PathBuf>,
    /// GDB server endpoint (`-gdb`), e.g. `tcp:localhost:1234`.
    pub gdb: Option<String>,
    /// Freeze the CPU at startup (`-S`) and wait for a debugger.
    pub stop: bool,
    /// Extra environment variables for the emulator process.
    pub env: BTreeMap<String, String>,
}

impl QemuSystem {
    /// Name of the emulator executable for the configured architecture.
    pub fn program(&self) -> String {
        format!(
            "qemu-system-{}",
            self.architecture.as_deref().unwrap_or("x86_64")
        )
    }

    /// Whether this configuration leaves the emulator waiting for a debugger
    /// to attach. Such invocations are spawned detached and never awaited.
    pub fn suspends(&self) -> bool {
        self.stop || self.gdb.is_some()
    }

    /// Synthesize the ordered argument list. The category order is fixed; the
    /// order of elements within each list field is preserved.
    pub fn args(&self) -> Vec<String> {
        let mut args = Vec::new();

        // machine
        if let Some(value) = &self.machine {
            args.extend(["-machine".to_string(), value.clone()]);
        }
        if let Some(value) = &self.cpu {
            args.extend(["-cpu".to_string(), value.clone()]);
        }
        for value in &self.accelerators {
            args.extend(["-accel".to_string(), value.clone()]);
        }

        // drivers
        for value in &self.character_drivers {
            args.extend(["-chardev".to_string(), value.clone()]);
        }
        for value in &self.block_drivers {
            args.extend(["-blockdev".to_string(), value.clone()]);
        }

        // devices
        if let Some(value) = &self.debug_console {
            args.extend(["-debugcon".to_string(), value.clone()]);
        }
        for value in &self.devices {
            args.extend(["-device".to_string(), value.clone()]);
        }
        if let Some(value) = &self.display {
            args.extend(["-display".to_string(), value.clone()]);
        }
        for value in &self.drives {
            args.extend(["-drive".to_string(), value.clone()]);
        }
        if let Some(value) = &self.rtc {
            args.extend(["-rtc".to_string(), value.clone()]);
        }

        // software
        if let Some(value) = &self.bios {
            args.extend(["-bios".to_string(), value.to_string()]);
        }
        if let Some(value) = &self.kernel {
            args.extend(["-kernel".to_string(), value.to_string()]);
        }

        // support
        if let Some(value) = &self.debug {
            args.extend(["-d".to_string(), value.clone()]);
        }
        if let Some(value) = &self.debug_file {
            args.extend(["-D".to_string(), value.to_string()]);
        }
        if let Some(value) = &self.gdb {
            args.extend(["-gdb".to_string(), value.clone()]);
        }
        if self.stop {
            args.push("-S".to_string());
        }

        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_synthesizes_nothing() {
        let qemu = QemuSystem::default();
        assert_eq!(qemu.args(), Vec::<String>::new());
    }

    #[test]
    fn category_order_is_fixed() {
        // Populated "backwards" relative to the emission order.
        let qemu = QemuSystem {
            stop: true,
            gdb: Some("tcp:localhost:1234".into()),
            kernel: Some("/img/kernel.bin".into()),
            devices: vec!["isa-debug-exit".into()],
            character_drivers: vec!["stdio,id=console".into()],
            cpu: Some("max".into()),
            machine: Some("q35".into()),
            ..QemuSystem::default()
        };

        assert_eq!(
            qemu.args(),
            vec![
                "-machine",
                "q35",
                "-cpu",
                "max",
                "-chardev",
                "stdio,id=console",
                "-device",
                "isa-debug-exit",
                "-kernel",
                "/img/kernel.bin",
                "-gdb",
                "tcp:localhost:1234",
                "-S",
            ]
        );
    }

    #[test]
    fn list_fields_emit_one_pair_per_element() {
        let qemu = QemuSystem {
            devices: vec!["a".into(), "b".into()],
            ..QemuSystem::default()
        };

        assert_eq!(qemu.args(), vec!["-device", "a", "-device", "b"]);
    }

    #[test]
    fn stop_is_a_lone_token() {
        let off = QemuSystem::default();
        assert!(!off.args().contains(&"-S".to_string()));

        let on = QemuSystem {
            stop: true,
            ..QemuSystem::default()
        };
        assert_eq!(on.args(), vec!["-S"]);
    }

    #[test]
    fn bios_and_kernel_are_both_passed_through() {
        let qemu = QemuSystem {
            bios: Some("/firmware/ovmf.fd".into()),
            kernel: Some("/img/kernel.bin".into()),
            ..QemuSystem::default()
        };

        assert_eq!(
            qemu.args(),
            vec!["-bios", "/firmware/ovmf.fd", "-kernel", "/img/kernel.bin"]
        );
    }

    #[test]
    fn kernel_boot_with_machine_and_stop() {
        let qemu = QemuSystem {
            kernel: Some("/img/x.bin".into()),
            machine: Some("q35".into()),
            stop: true,
            ..QemuSystem::default()
        };

        assert_eq!(
            qemu.args(),
            vec!["-machine", "q35", "-kernel", "/img/x.bin", "-S"]
        );
    }

    #[test]
    fn program_follows_architecture() {
        let mut qemu = QemuSystem::default();
        assert_eq!(qemu.program(), "qemu-system-x86_64");

        qemu.architecture = Some("i386".into());
        assert_eq!(qemu.program(), "qemu-system-i386");
    }

    #[test]
    fn gdb_or_stop_suspend_the_invocation() {
        assert!(!QemuSystem::default().suspends());
        assert!(
            QemuSystem {
                stop: true,
                ..QemuSystem::default()
            }
            .suspends()
        );
        assert!(
            QemuSystem {
                gdb: Some("tcp:localhost:1234".into()),
                ..QemuSystem::default()
            }
            .suspends()
        );
    }
}
