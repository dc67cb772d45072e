//! Fetch/configure/build bootstrap for vendored native dependencies.
//!
//! A dependency built from source (for example a unit test framework) goes
//! through three strictly sequential steps: a shallow clone of the upstream
//! repository, a CMake configure pass, and a CMake build. The clone happens
//! at most once, guarded purely by the existence of the source directory; the
//! configure and build steps re-run every time and rely on the underlying
//! build system's own short-circuiting. Any step exiting non-zero aborts the
//! chain before artifacts are published.

use camino::{Utf8Path, Utf8PathBuf};

use crate::blueprint::Blueprint;
use crate::process::Invocation;
use crate::task::Handle;

/// A source dependency materialized on first use.
#[derive(Clone, Debug)]
pub struct ExternalDependency {
    pub name: String,
    /// Upstream repository, cloned shallowly.
    pub url: String,
    /// Where the clone lands; its existence suppresses any further fetch.
    pub source_dir: Utf8PathBuf,
    /// Out-of-tree CMake build directory.
    pub build_dir: Utf8PathBuf,
    /// Optional CMake toolchain file for cross builds.
    pub toolchain_file: Option<Utf8PathBuf>,
    /// Include directories published to consumers, relative to `source_dir`.
    pub includes: Vec<Utf8PathBuf>,
    /// Link artifacts published to consumers, relative to `build_dir`.
    pub linkables: Vec<Utf8PathBuf>,
}

/// The published artifacts of a built dependency, as absolute paths.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Artifacts {
    pub includes: Vec<Utf8PathBuf>,
    pub linkables: Vec<Utf8PathBuf>,
}

impl ExternalDependency {
    /// The conventional googletest setup: shallow clone from upstream, built
    /// in `Release` mode, publishing its headers and the static library.
    pub fn googletest(base: impl AsRef<Utf8Path>) -> Self {
        let base = base.as_ref();
        Self {
            name: "googletest".into(),
            url: "https://github.com/google/googletest".into(),
            source_dir: base.join("src"),
            build_dir: base.join("obj"),
            toolchain_file: None,
            includes: vec!["googletest/include".into()],
            linkables: vec!["lib/libgtest.a".into()],
        }
    }

    pub fn with_toolchain_file(mut self, file: impl Into<Utf8PathBuf>) -> Self {
        self.toolchain_file = Some(file.into());
        self
    }

    /// Wires the fetch → configure → build chain into the blueprint and
    /// returns the handle publishing the dependency's artifacts.
    pub fn register(self, blueprint: &mut Blueprint) -> Handle<Artifacts> {
        let Self {
            name,
            url,
            source_dir,
            build_dir,
            toolchain_file,
            includes,
            linkables,
        } = self;

        let fetch = {
            let probe_dir = source_dir.clone();
            let source_dir = source_dir.clone();
            blueprint.task().name(format!("fetch-{name}")).run_unless(
                move || probe_dir.is_dir().then_some(()),
                move |ctx| {
                    let invocation = Invocation::new("git").args([
                        "clone",
                        "--depth",
                        "1",
                        url.as_str(),
                        source_dir.as_str(),
                    ]);
                    ctx.tools.run(&invocation, ctx.cancel)?;
                    Ok(())
                },
            )
        };

        // Re-runs every time; idempotence is the generator's business.
        let configure = {
            let source_dir = source_dir.clone();
            let build_dir = build_dir.clone();
            blueprint
                .task()
                .name(format!("configure-{name}"))
                .depends_on(fetch)
                .run(move |ctx, _| {
                    let mut invocation = Invocation::new("cmake").args([
                        "-B",
                        build_dir.as_str(),
                        "-DCMAKE_BUILD_TYPE=Release",
                    ]);
                    if let Some(file) = &toolchain_file {
                        invocation = invocation.arg(format!("-DCMAKE_TOOLCHAIN_FILE={file}"));
                    }
                    invocation = invocation.args(["-G", "Ninja", "-S", source_dir.as_str()]);
                    ctx.tools.run(&invocation, ctx.cancel)?;
                    Ok(())
                })
        };

        blueprint
            .task()
            .name(format!("build-{name}"))
            .depends_on(configure)
            .run(move |ctx, _| {
                let invocation = Invocation::new("cmake").args(["--build", build_dir.as_str()]);
                ctx.tools.run(&invocation, ctx.cancel)?;

                Ok(Artifacts {
                    includes: includes.iter().map(|p| source_dir.join(p)).collect(),
                    linkables: linkables.iter().map(|p| build_dir.join(p)).collect(),
                })
            })
    }
}

#[cfg(test)]
mod tests {
    use camino::Utf8PathBuf;

    use super::*;
    use crate::process::testing::RecordingTools;

    fn dependency(base: &Utf8Path) -> ExternalDependency {
        ExternalDependency::googletest(base)
    }

    #[test]
    fn steps_run_in_fetch_configure_build_order() {
        let tools = RecordingTools::default();
        let dir = tempfile::tempdir().unwrap();
        let base = Utf8PathBuf::from_path_buf(dir.path().to_owned()).unwrap();

        let mut blueprint = Blueprint::new();
        let artifacts = dependency(&base).register(&mut blueprint);

        let outcome = blueprint.finish().run(&tools).unwrap();

        assert_eq!(tools.programs(), ["git", "cmake", "cmake"]);

        let published = outcome.get(artifacts).unwrap();
        assert_eq!(
            published.includes,
            vec![base.join("src/googletest/include")]
        );
        assert_eq!(published.linkables, vec![base.join("obj/lib/libgtest.a")]);
    }

    #[test]
    fn existing_source_directory_suppresses_the_fetch() {
        let tools = RecordingTools::default();
        let dir = tempfile::tempdir().unwrap();
        let base = Utf8PathBuf::from_path_buf(dir.path().to_owned()).unwrap();

        std::fs::create_dir_all(base.join("src")).unwrap();

        let mut blueprint = Blueprint::new();
        let _artifacts = dependency(&base).register(&mut blueprint);
        let workbench = blueprint.finish();

        // Configure and build re-run per invocation; the fetch never does.
        for _ in 0..2 {
            workbench.run(&tools).unwrap();
        }

        assert_eq!(tools.count("git"), 0);
        assert_eq!(tools.count("cmake"), 4);
    }

    #[test]
    fn configure_includes_the_toolchain_file() {
        let tools = RecordingTools::default();
        let dir = tempfile::tempdir().unwrap();
        let base = Utf8PathBuf::from_path_buf(dir.path().to_owned()).unwrap();

        std::fs::create_dir_all(base.join("src")).unwrap();

        let mut blueprint = Blueprint::new();
        let _artifacts = dependency(&base)
            .with_toolchain_file(base.join("llvm.cmake"))
            .register(&mut blueprint);

        blueprint.finish().run(&tools).unwrap();

        let invocations = tools.invocations.lock().unwrap();
        let configure = invocations
            .iter()
            .find(|i| i.args.iter().any(|a| a == "-G"))
            .unwrap();
        let toolchain = format!("-DCMAKE_TOOLCHAIN_FILE={}", base.join("llvm.cmake"));
        assert!(configure.args.contains(&toolchain));
    }

    #[test]
    fn shallow_clone_targets_the_source_directory() {
        let tools = RecordingTools::default();
        let dir = tempfile::tempdir().unwrap();
        let base = Utf8PathBuf::from_path_buf(dir.path().to_owned()).unwrap();

        let mut blueprint = Blueprint::new();
        let _artifacts = dependency(&base).register(&mut blueprint);
        blueprint.finish().run(&tools).unwrap();

        let invocations = tools.invocations.lock().unwrap();
        let git = invocations.iter().find(|i| i.program == "git").unwrap();
        assert_eq!(
            git.args,
            vec![
                "clone".to_string(),
                "--depth".into(),
                "1".into(),
                "https://github.com/google/googletest".into(),
                base.join("src").to_string(),
            ]
        );
    }
}
