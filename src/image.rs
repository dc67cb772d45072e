//! The image pipeline: pack a linked binary into a bootable multiboot image,
//! then boot that image under QEMU.
//!
//! Creation and run are two chained tasks. The image task consumes the linked
//! binary produced by the native toolchain and emits a `grub-mkrescue` ISO;
//! the run task consumes the image, points the launch configuration's
//! `kernel` field at it, and spawns the emulator. Launches configured for a
//! debugger attach (`gdb`/`stop`) are left running; everything else is
//! awaited and checked for a clean exit.

use std::collections::BTreeMap;
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;

use crate::blueprint::Blueprint;
use crate::error::{ImageError, RunError};
use crate::process::Invocation;
use crate::qemu::QemuSystem;
use crate::task::{Handle, TaskContext};

/// A build target: one linked kernel binary, identified by name.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Target {
    pub name: String,
    pub binary: Utf8PathBuf,
}

/// A bootable image on disk. This is a pass-through reference to the file,
/// never a copy of its contents.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageArtifact {
    pub path: Utf8PathBuf,
}

/// What became of the emulator process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunStatus {
    /// The emulator ran to completion with a clean exit.
    Exited,
    /// The emulator was left running for a debugger to attach.
    Detached { pid: u32 },
}

/// Handles to the pair of tasks registered for one target.
#[derive(Clone, Copy, Debug)]
pub struct TargetHandles {
    pub image: Handle<ImageArtifact>,
    pub run: Handle<RunStatus>,
}

/// Packs `binary` into a bootable multiboot image under `out_dir`.
///
/// Stages an ISO tree (`boot/grub/grub.cfg` plus the binary) and invokes
/// `grub-mkrescue` over it. A missing binary or a failing tool is fatal to
/// this invocation; nothing is retried.
pub fn create_image(
    ctx: &TaskContext,
    binary: &Utf8Path,
    out_dir: &Utf8Path,
    name: &str,
) -> Result<ImageArtifact, ImageError> {
    if !binary.is_file() {
        return Err(ImageError::MissingBinary(binary.to_owned()));
    }

    let stage = out_dir.join(name);
    let grub_dir = stage.join("boot/grub");
    fs::create_dir_all(&grub_dir)?;
    fs::copy(binary, stage.join("boot").join(name))?;
    fs::write(grub_dir.join("grub.cfg"), grub_cfg(name))?;

    let image = out_dir.join(format!("{name}.img"));
    let invocation =
        Invocation::new("grub-mkrescue").args(["-o", image.as_str(), stage.as_str()]);
    ctx.tools.run(&invocation, ctx.cancel)?;

    tracing::info!(image = %image, "created bootable image");
    Ok(ImageArtifact { path: image })
}

fn grub_cfg(name: &str) -> String {
    format!(
        "set timeout=0\n\
         set default=0\n\
         \n\
         menuentry \"{name}\" {{\n\
         \tmultiboot2 /boot/{name}\n\
         \tboot\n\
         }}\n"
    )
}

/// Boots `artifact` under the emulator described by `qemu`.
///
/// The launch configuration's `kernel` field is overwritten with the artifact
/// path before synthesis. When the configuration suspends for a debugger, the
/// child is spawned detached and its pid returned; the pipeline neither waits
/// on nor kills it.
pub fn run_image(
    ctx: &TaskContext,
    artifact: &ImageArtifact,
    qemu: &QemuSystem,
) -> Result<RunStatus, RunError> {
    let mut qemu = qemu.clone();
    qemu.kernel = Some(artifact.path.clone());

    let mut invocation = Invocation::new(qemu.program()).args(qemu.args());
    for (key, value) in &qemu.env {
        invocation = invocation.env(key, value);
    }

    if qemu.suspends() {
        let pid = ctx.tools.spawn(&invocation)?;
        tracing::info!(pid, "emulator left running for debugger attach");
        Ok(RunStatus::Detached { pid })
    } else {
        ctx.tools.run(&invocation, ctx.cancel)?;
        Ok(RunStatus::Exited)
    }
}

/// Registers the create/run task pair for one target.
///
/// The image task carries a freshness probe: when the image file is already
/// newer than the binary, creation is skipped and the existing artifact is
/// reused.
pub fn register_target(
    blueprint: &mut Blueprint,
    target: &Target,
    qemu: &QemuSystem,
    out_dir: impl Into<Utf8PathBuf>,
) -> TargetHandles {
    let out_dir = out_dir.into();
    let name = target.name.clone();
    let binary = target.binary.clone();
    let image_file = out_dir.join(format!("{name}.img"));

    let probe_binary = binary.clone();
    let image = blueprint
        .task()
        .name(format!("image-{name}"))
        .run_unless(
            move || {
                up_to_date(&image_file, &probe_binary).then(|| ImageArtifact {
                    path: image_file.clone(),
                })
            },
            {
                let name = name.clone();
                move |ctx| Ok(create_image(ctx, &binary, &out_dir, &name)?)
            },
        );

    let run_qemu = qemu.clone();
    let run = blueprint
        .task()
        .name(format!("run-image-{name}"))
        .depends_on(image)
        .run(move |ctx, artifact: &ImageArtifact| Ok(run_image(ctx, artifact, &run_qemu)?));

    TargetHandles { image, run }
}

/// Registers create/run tasks for a target whose binary is produced by an
/// upstream task rather than known up front.
pub fn register_target_for(
    blueprint: &mut Blueprint,
    name: &str,
    link: Handle<Utf8PathBuf>,
    qemu: &QemuSystem,
    out_dir: impl Into<Utf8PathBuf>,
) -> TargetHandles {
    let out_dir = out_dir.into();
    let task_name = name.to_string();

    let image = blueprint
        .task()
        .name(format!("image-{name}"))
        .depends_on(link)
        .run(move |ctx, binary: &Utf8PathBuf| {
            Ok(create_image(ctx, binary, &out_dir, &task_name)?)
        });

    let run_qemu = qemu.clone();
    let run = blueprint
        .task()
        .name(format!("run-image-{name}"))
        .depends_on(image)
        .run(move |ctx, artifact: &ImageArtifact| Ok(run_image(ctx, artifact, &run_qemu)?));

    TargetHandles { image, run }
}

/// Registers the task pair for every target, keyed by target name.
pub fn register_targets(
    blueprint: &mut Blueprint,
    targets: &[Target],
    qemu: &QemuSystem,
    out_dir: impl Into<Utf8PathBuf>,
) -> BTreeMap<String, TargetHandles> {
    let out_dir = out_dir.into();
    targets
        .iter()
        .map(|target| {
            let handles = register_target(blueprint, target, qemu, out_dir.clone());
            (target.name.clone(), handles)
        })
        .collect()
}

// Output exists and is at least as recent as the input.
fn up_to_date(output: &Utf8Path, input: &Utf8Path) -> bool {
    let Ok(output) = fs::metadata(output).and_then(|m| m.modified()) else {
        return false;
    };
    let Ok(input) = fs::metadata(input).and_then(|m| m.modified()) else {
        return false;
    };
    output >= input
}
