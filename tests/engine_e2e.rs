//! End-to-end scenarios against a real engine and a tempdir project.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::TempDir;

use kake::builder::staleness::Sidecar;
use kake::rules::IncludeScanner;
use kake::{
    BuildContext, BuildCx, BuildError, BuildOptions, Capability, CancelToken, Engine,
    EngineConfig, Rule,
};

struct TestProject {
    tmp: TempDir,
    engine: Engine,
}

impl TestProject {
    fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let engine = Engine::new(EngineConfig::new(tmp.path()).workers(4)).unwrap();
        TestProject { tmp, engine }
    }

    fn write(&self, rel: &str, contents: &str) {
        let path = self.tmp.path().join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, contents).unwrap();
    }

    fn read(&self, rel: &str) -> String {
        std::fs::read_to_string(self.tmp.path().join(rel)).unwrap()
    }

    fn exists(&self, rel: &str) -> bool {
        self.tmp.path().join(rel).exists()
    }

    /// Rewrite a file after letting the clock move, so mtime comparisons
    /// see the change, and drop the engine's cached stats the way a host
    /// file watcher would.
    fn modify(&self, rel: &str, contents: &str) {
        std::thread::sleep(Duration::from_millis(30));
        self.write(rel, contents);
        self.engine.invalidate_filesystem_view();
    }

    fn remove(&self, rel: &str) {
        std::thread::sleep(Duration::from_millis(30));
        std::fs::remove_file(self.tmp.path().join(rel)).unwrap();
        self.engine.invalidate_filesystem_view();
    }
}

/// Concatenates its inputs, appends a configurable suffix, and counts
/// invocations.
struct Concat {
    calls: AtomicUsize,
    version: AtomicU32,
    suffix: Mutex<String>,
    used_keys: Vec<String>,
    delay: Option<Duration>,
}

impl Concat {
    fn new(suffix: &str) -> Arc<Self> {
        Arc::new(Concat {
            calls: AtomicUsize::new(0),
            version: AtomicU32::new(1),
            suffix: Mutex::new(suffix.to_string()),
            used_keys: Vec::new(),
            delay: None,
        })
    }

    fn with_keys(suffix: &str, keys: &[&str]) -> Arc<Self> {
        let mut cap = Concat {
            calls: AtomicUsize::new(0),
            version: AtomicU32::new(1),
            suffix: Mutex::new(suffix.to_string()),
            used_keys: keys.iter().map(|k| k.to_string()).collect(),
            delay: None,
        };
        cap.used_keys.sort();
        Arc::new(cap)
    }

    fn slow(suffix: &str, delay: Duration) -> Arc<Self> {
        Arc::new(Concat {
            calls: AtomicUsize::new(0),
            version: AtomicU32::new(1),
            suffix: Mutex::new(suffix.to_string()),
            used_keys: Vec::new(),
            delay: Some(delay),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn change_implementation(&self, suffix: &str, version: u32) {
        *self.suffix.lock().unwrap() = suffix.to_string();
        self.version.store(version, Ordering::SeqCst);
    }
}

impl Capability for Concat {
    fn version(&self) -> u32 {
        self.version.load(Ordering::SeqCst)
    }

    fn build(
        &self,
        cx: &BuildCx<'_>,
        output: &str,
        inputs: &[String],
        _changed: &[String],
    ) -> Result<(), BuildError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }

        let mut body = String::new();
        for input in inputs {
            body.push_str(
                &std::fs::read_to_string(cx.abspath(input))
                    .map_err(|e| BuildError::io(input, e))?,
            );
        }
        for key in &self.used_keys {
            if let Some(value) = cx.context().get(key) {
                body.push_str(value);
            }
        }
        body.push_str(&self.suffix.lock().unwrap());

        kake::util::fs::write_string(&cx.abspath(output), &body)
            .map_err(|e| BuildError::io(output, e))
    }

    fn used_context_keys(&self) -> Vec<String> {
        self.used_keys.clone()
    }
}

// S1 first build, S2 no-op, S3 input change, S4 version bump, and the
// idempotence invariant.
#[test]
fn test_build_rebuild_cycle() {
    let p = TestProject::new();
    p.write("a.txt", "hello");

    let cap = Concat::new("X");
    p.engine
        .register_compile("concat", "genfiles/out.txt", ["a.txt"], cap.clone())
        .unwrap();
    let ctx = BuildContext::new();

    // First build writes the output and a sidecar recording version 1.
    assert!(p.engine.build("genfiles/out.txt", &ctx).unwrap());
    assert_eq!(p.read("genfiles/out.txt"), "helloX");
    assert_eq!(cap.calls(), 1);
    let sidecar = Sidecar::load(p.engine.project(), "genfiles/out.txt").unwrap();
    assert_eq!(sidecar.version_tag, 1);
    assert_eq!(sidecar.inputs, vec!["a.txt"]);

    // Immediate rebuild is a no-op.
    assert!(!p.engine.build("genfiles/out.txt", &ctx).unwrap());
    assert_eq!(cap.calls(), 1);

    // Changing the input rebuilds exactly once.
    p.modify("a.txt", "world");
    assert!(p.engine.build("genfiles/out.txt", &ctx).unwrap());
    assert_eq!(p.read("genfiles/out.txt"), "worldX");
    assert_eq!(cap.calls(), 2);

    // Bumping the capability version rebuilds with no file changes.
    cap.change_implementation("Y", 2);
    assert!(p.engine.build("genfiles/out.txt", &ctx).unwrap());
    assert_eq!(p.read("genfiles/out.txt"), "worldY");
    assert_eq!(cap.calls(), 3);
    assert_eq!(
        Sidecar::load(p.engine.project(), "genfiles/out.txt")
            .unwrap()
            .version_tag,
        2
    );

    assert!(!p.engine.build("genfiles/out.txt", &ctx).unwrap());
    assert_eq!(cap.calls(), 3);
}

// S5: glob inputs are expanded in sorted order and the input *set* is
// part of staleness.
#[test]
fn test_glob_inputs_track_additions_and_removals() {
    let p = TestProject::new();
    p.write("parts/b.txt", "b");
    p.write("parts/a.txt", "a");

    let cap = Concat::new("");
    p.engine
        .register_compile("bundle", "genfiles/bundle.txt", ["parts/*.txt"], cap.clone())
        .unwrap();
    let ctx = BuildContext::new();

    p.engine.build("genfiles/bundle.txt", &ctx).unwrap();
    assert_eq!(p.read("genfiles/bundle.txt"), "ab");

    // A new part joins the bundle on the next build.
    p.modify("parts/c.txt", "c");
    assert!(p.engine.build("genfiles/bundle.txt", &ctx).unwrap());
    assert_eq!(p.read("genfiles/bundle.txt"), "abc");

    // Deleting a part shrinks it, even though no surviving file changed.
    p.remove("parts/a.txt");
    assert!(p.engine.build("genfiles/bundle.txt", &ctx).unwrap());
    assert_eq!(p.read("genfiles/bundle.txt"), "bc");
    assert_eq!(cap.calls(), 3);
}

/// Compiles a stylesheet whose imports are discovered by scanning.
struct CssCompile {
    calls: AtomicUsize,
    scanner: IncludeScanner,
}

impl CssCompile {
    fn new() -> Arc<Self> {
        Arc::new(CssCompile {
            calls: AtomicUsize::new(0),
            scanner: IncludeScanner::new(r#"@import\s+"([^"]+)""#).unwrap(),
        })
    }
}

impl Capability for CssCompile {
    fn version(&self) -> u32 {
        1
    }

    fn computed_inputs(
        &self,
        cx: &kake::core::rule::InputsCx<'_>,
        _output: &str,
        current_inputs: &[String],
    ) -> Result<Vec<String>, BuildError> {
        self.scanner.transitive(cx, current_inputs)
    }

    fn build(
        &self,
        cx: &BuildCx<'_>,
        output: &str,
        inputs: &[String],
        _changed: &[String],
    ) -> Result<(), BuildError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut body = String::new();
        for input in inputs {
            body.push_str(
                &std::fs::read_to_string(cx.abspath(input))
                    .map_err(|e| BuildError::io(input, e))?,
            );
        }
        kake::util::fs::write_string(&cx.abspath(output), &body)
            .map_err(|e| BuildError::io(output, e))
    }
}

// S6: touching a discovered import rebuilds the importer.
#[test]
fn test_computed_inputs_follow_imports() {
    let p = TestProject::new();
    p.write("main.css", "@import \"x.css\"\nbody{}\n");
    p.write("x.css", ".x{}\n");

    let cap = CssCompile::new();
    p.engine
        .register_compile("css", "genfiles/main.css.out", ["main.css"], cap.clone())
        .unwrap();
    let ctx = BuildContext::new();

    p.engine.build("genfiles/main.css.out", &ctx).unwrap();
    assert!(p.read("genfiles/main.css.out").contains(".x{}"));
    assert_eq!(cap.calls.load(Ordering::SeqCst), 1);

    // The import is a real input now.
    p.modify("x.css", ".x{color:red}\n");
    assert!(p.engine.build("genfiles/main.css.out", &ctx).unwrap());
    assert!(p.read("genfiles/main.css.out").contains("color:red"));
    assert_eq!(cap.calls.load(Ordering::SeqCst), 2);

    // Adding an import through the base file is picked up transitively.
    p.modify("y.css", ".y{}\n");
    p.modify("main.css", "@import \"x.css\"\n@import \"y.css\"\nbody{}\n");
    assert!(p.engine.build("genfiles/main.css.out", &ctx).unwrap());
    assert!(p.read("genfiles/main.css.out").contains(".y{}"));
}

/// A translation rule: English output is byte-identical to the source, so
/// it offers the symlink fast path.
struct Translate {
    calls: AtomicUsize,
}

impl Translate {
    fn new() -> Arc<Self> {
        Arc::new(Translate {
            calls: AtomicUsize::new(0),
        })
    }
}

impl Capability for Translate {
    fn version(&self) -> u32 {
        1
    }

    fn maybe_symlink_to(
        &self,
        _output: &str,
        bindings: &kake::core::pattern::Bindings,
    ) -> Option<String> {
        if bindings.get("lang").map(String::as_str) == Some("en") {
            Some(format!("texts/{}", bindings.get("file").unwrap()))
        } else {
            None
        }
    }

    fn build(
        &self,
        cx: &BuildCx<'_>,
        output: &str,
        inputs: &[String],
        _changed: &[String],
    ) -> Result<(), BuildError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let source = std::fs::read_to_string(cx.abspath(&inputs[0]))
            .map_err(|e| BuildError::io(&inputs[0][..], e))?;
        let lang = cx.context().get("lang").unwrap_or("??").to_string();
        kake::util::fs::write_string(&cx.abspath(output), &format!("[{lang}] {source}"))
            .map_err(|e| BuildError::io(output, e))
    }
}

// S7: the symlink fast path replaces the heavy build for "en".
#[cfg(unix)]
#[test]
fn test_symlink_fast_path() {
    let p = TestProject::new();
    p.write("texts/page.txt", "english text");

    let cap = Translate::new();
    p.engine
        .register_compile(
            "translate",
            "genfiles/tr/{lang}/{file}",
            ["texts/{file}"],
            cap.clone(),
        )
        .unwrap();
    let ctx = BuildContext::new();

    assert!(p.engine.build("genfiles/tr/en/page.txt", &ctx).unwrap());
    assert_eq!(cap.calls.load(Ordering::SeqCst), 0);
    let link = p.tmp.path().join("genfiles/tr/en/page.txt");
    assert!(link.symlink_metadata().unwrap().file_type().is_symlink());
    assert_eq!(p.read("genfiles/tr/en/page.txt"), "english text");

    // Other languages still run the real build.
    assert!(p.engine.build("genfiles/tr/fr/page.txt", &ctx).unwrap());
    assert_eq!(cap.calls.load(Ordering::SeqCst), 1);
    assert_eq!(p.read("genfiles/tr/fr/page.txt"), "[fr] english text");
}

// S8 and the single-flight invariant: sixteen concurrent requests, one
// capability invocation, one answer.
#[test]
fn test_concurrent_builds_coalesce() {
    let p = TestProject::new();
    p.write("a.txt", "hello");

    let cap = Concat::slow("X", Duration::from_millis(100));
    p.engine
        .register_compile("concat", "genfiles/out.txt", ["a.txt"], cap.clone())
        .unwrap();

    std::thread::scope(|scope| {
        let mut handles = Vec::new();
        for _ in 0..16 {
            let engine = &p.engine;
            handles.push(scope.spawn(move || {
                let ctx = BuildContext::new();
                engine.build("genfiles/out.txt", &ctx).map(|_| ())
            }));
        }
        for handle in handles {
            handle.join().unwrap().unwrap();
        }
    });

    assert_eq!(cap.calls(), 1);
    assert_eq!(p.read("genfiles/out.txt"), "helloX");
}

// Minimum rebuild: a change rebuilds its dependents and nothing else.
#[test]
fn test_minimum_rebuild() {
    let p = TestProject::new();
    p.write("src.txt", "s");
    p.write("other_src.txt", "o");

    let mid_cap = Concat::new("-mid");
    let top_cap = Concat::new("-top");
    let other_cap = Concat::new("-other");
    p.engine
        .register_compile("mid", "genfiles/mid.txt", ["src.txt"], mid_cap.clone())
        .unwrap();
    p.engine
        .register_compile("top", "genfiles/top.txt", ["genfiles/mid.txt"], top_cap.clone())
        .unwrap();
    p.engine
        .register_compile(
            "other",
            "genfiles/other.txt",
            ["other_src.txt"],
            other_cap.clone(),
        )
        .unwrap();
    let ctx = BuildContext::new();

    let rebuilt = p
        .engine
        .build_many(&["genfiles/top.txt", "genfiles/other.txt"], &ctx)
        .unwrap();
    assert_eq!(rebuilt.len(), 2);
    assert_eq!(p.read("genfiles/top.txt"), "s-mid-top");

    // Touch the deep source: the chain above it rebuilds, the unrelated
    // target does not.
    p.modify("src.txt", "s2");
    p.engine
        .build_many(&["genfiles/top.txt", "genfiles/other.txt"], &ctx)
        .unwrap();
    assert_eq!(mid_cap.calls(), 2);
    assert_eq!(top_cap.calls(), 2);
    assert_eq!(other_cap.calls(), 1);
    assert_eq!(p.read("genfiles/top.txt"), "s2-mid-top");
}

// Context sensitivity: only declared keys matter.
#[test]
fn test_context_sensitivity() {
    let p = TestProject::new();
    p.write("a.txt", "a");

    let cap = Concat::with_keys("", &["mode"]);
    p.engine
        .register_compile("ctx", "genfiles/out.txt", ["a.txt"], cap.clone())
        .unwrap();

    let debug = BuildContext::new().with("mode", "debug");
    assert!(p.engine.build("genfiles/out.txt", &debug).unwrap());
    assert_eq!(p.read("genfiles/out.txt"), "adebug");
    assert_eq!(cap.calls(), 1);

    // Same declared key, same value: fresh.
    assert!(!p.engine.build("genfiles/out.txt", &debug).unwrap());

    // An undeclared key changing does not rebuild.
    let noisy = BuildContext::new().with("mode", "debug").with("noise", "1");
    assert!(!p.engine.build("genfiles/out.txt", &noisy).unwrap());
    assert_eq!(cap.calls(), 1);

    // The declared key changing does.
    let release = BuildContext::new().with("mode", "release");
    assert!(p.engine.build("genfiles/out.txt", &release).unwrap());
    assert_eq!(p.read("genfiles/out.txt"), "arelease");
    assert_eq!(cap.calls(), 2);
}

// Acyclicity: A -> B -> A fails with the chain.
#[test]
fn test_cycle_detection() {
    let p = TestProject::new();

    p.engine
        .register_compile("a", "genfiles/a.txt", ["genfiles/b.txt"], Concat::new(""))
        .unwrap();
    p.engine
        .register_compile("b", "genfiles/b.txt", ["genfiles/a.txt"], Concat::new(""))
        .unwrap();

    let err = p
        .engine
        .build("genfiles/a.txt", &BuildContext::new())
        .unwrap_err();
    match err {
        BuildError::CycleDetected { chain } => {
            assert!(chain.contains(&"genfiles/a.txt".to_string()));
            assert!(chain.contains(&"genfiles/b.txt".to_string()));
        }
        other => panic!("expected a cycle, got {other:?}"),
    }
}

// Exact-match priority: a literal rule beats a pattern registered before
// it.
#[test]
fn test_exact_match_beats_pattern() {
    let p = TestProject::new();
    p.write("a.txt", "a");

    let generic = Concat::new("-generic");
    let exact = Concat::new("-exact");
    p.engine
        .register_compile("generic", "genfiles/{name}.out", ["a.txt"], generic.clone())
        .unwrap();
    p.engine
        .register_compile("exact", "genfiles/special.out", ["a.txt"], exact.clone())
        .unwrap();
    let ctx = BuildContext::new();

    p.engine.build("genfiles/special.out", &ctx).unwrap();
    assert_eq!(p.read("genfiles/special.out"), "a-exact");
    assert_eq!(generic.calls(), 0);

    p.engine.build("genfiles/plain.out", &ctx).unwrap();
    assert_eq!(p.read("genfiles/plain.out"), "a-generic");
}

/// Produces two outputs from one invocation.
struct PairCap {
    calls: AtomicUsize,
}

impl Capability for PairCap {
    fn version(&self) -> u32 {
        1
    }

    fn split_outputs(
        &self,
        _output: &str,
        _bindings: &kake::core::pattern::Bindings,
    ) -> Vec<String> {
        vec![
            "genfiles/pair.1.txt".to_string(),
            "genfiles/pair.2.txt".to_string(),
        ]
    }

    fn build(
        &self,
        cx: &BuildCx<'_>,
        _output: &str,
        _inputs: &[String],
        _changed: &[String],
    ) -> Result<(), BuildError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        kake::util::fs::write_string(&cx.abspath("genfiles/pair.1.txt"), "one")
            .and_then(|_| kake::util::fs::write_string(&cx.abspath("genfiles/pair.2.txt"), "two"))
            .map_err(|e| BuildError::io("genfiles/pair.*", e))
    }
}

// Split-outputs atomicity: both files and both sidecars appear after one
// build, and the sibling is already fresh.
#[test]
fn test_split_outputs() {
    let p = TestProject::new();
    p.write("seed.txt", "s");

    let cap = Arc::new(PairCap {
        calls: AtomicUsize::new(0),
    });
    p.engine
        .register_compile("pair", "genfiles/pair.{n}.txt", ["seed.txt"], cap.clone())
        .unwrap();
    let ctx = BuildContext::new();

    assert!(p.engine.build("genfiles/pair.1.txt", &ctx).unwrap());
    assert_eq!(p.read("genfiles/pair.1.txt"), "one");
    assert_eq!(p.read("genfiles/pair.2.txt"), "two");

    let s1 = Sidecar::load(p.engine.project(), "genfiles/pair.1.txt").unwrap();
    let s2 = Sidecar::load(p.engine.project(), "genfiles/pair.2.txt").unwrap();
    assert_eq!(s1.version_tag, s2.version_tag);
    assert_eq!(s1.context_digest, s2.context_digest);

    // The sibling was registered fresh by the same invocation.
    assert!(!p.engine.build("genfiles/pair.2.txt", &ctx).unwrap());
    assert_eq!(cap.calls.load(Ordering::SeqCst), 1);
}

/// Always fails.
struct Failing;

impl Capability for Failing {
    fn version(&self) -> u32 {
        1
    }

    fn build(
        &self,
        cx: &BuildCx<'_>,
        _output: &str,
        _inputs: &[String],
        _changed: &[String],
    ) -> Result<(), BuildError> {
        Err(cx.failure("deliberate failure"))
    }
}

// A failing dependency short-circuits its dependents, and no sidecar is
// written for the failure.
#[test]
fn test_failure_propagates_to_dependents() {
    let p = TestProject::new();
    p.write("src.txt", "s");

    let top_cap = Concat::new("-top");
    p.engine
        .register_compile("bad", "genfiles/bad.txt", ["src.txt"], Arc::new(Failing))
        .unwrap();
    p.engine
        .register_compile("top", "genfiles/top.txt", ["genfiles/bad.txt"], top_cap.clone())
        .unwrap();

    let err = p
        .engine
        .build("genfiles/top.txt", &BuildContext::new())
        .unwrap_err();
    match err {
        BuildError::BuildFailed { output, message, .. } => {
            assert_eq!(output, "genfiles/top.txt");
            assert!(message.contains("genfiles/bad.txt"));
        }
        other => panic!("expected BuildFailed, got {other:?}"),
    }
    assert_eq!(top_cap.calls(), 0);
    assert!(!p.exists("genfiles/bad.txt.__meta__"));
}

/// Claims success without creating its output.
struct Lazy;

impl Capability for Lazy {
    fn version(&self) -> u32 {
        1
    }

    fn build(
        &self,
        _cx: &BuildCx<'_>,
        _output: &str,
        _inputs: &[String],
        _changed: &[String],
    ) -> Result<(), BuildError> {
        Ok(())
    }
}

#[test]
fn test_missing_output_is_an_error() {
    let p = TestProject::new();
    p.write("a.txt", "a");

    p.engine
        .register_compile("lazy", "genfiles/out.txt", ["a.txt"], Arc::new(Lazy))
        .unwrap();

    let err = p
        .engine
        .build("genfiles/out.txt", &BuildContext::new())
        .unwrap_err();
    assert!(matches!(err, BuildError::MissingOutput { .. }));
}

/// Returns a brand-new input every round; the fixpoint can never settle.
struct Diverging {
    round: AtomicUsize,
}

impl Capability for Diverging {
    fn version(&self) -> u32 {
        1
    }

    fn computed_inputs(
        &self,
        cx: &kake::core::rule::InputsCx<'_>,
        _output: &str,
        _current_inputs: &[String],
    ) -> Result<Vec<String>, BuildError> {
        let n = self.round.fetch_add(1, Ordering::SeqCst);
        let name = format!("spiral_{n}.txt");
        std::fs::write(cx.project().abspath(&name), "x").unwrap();
        Ok(vec![name])
    }

    fn build(
        &self,
        _cx: &BuildCx<'_>,
        _output: &str,
        _inputs: &[String],
        _changed: &[String],
    ) -> Result<(), BuildError> {
        Ok(())
    }
}

#[test]
fn test_computed_inputs_divergence() {
    let tmp = TempDir::new().unwrap();
    let engine = Engine::new(
        EngineConfig::new(tmp.path())
            .workers(1)
            .computed_inputs_limit(3),
    )
    .unwrap();
    std::fs::write(tmp.path().join("base.txt"), "b").unwrap();

    engine
        .register_compile(
            "spiral",
            "genfiles/out.txt",
            ["base.txt"],
            Arc::new(Diverging {
                round: AtomicUsize::new(0),
            }),
        )
        .unwrap();

    let err = engine
        .build("genfiles/out.txt", &BuildContext::new())
        .unwrap_err();
    assert!(matches!(err, BuildError::ComputedInputsDivergence { .. }));
}

#[test]
fn test_cancelled_before_dispatch() {
    let p = TestProject::new();
    p.write("a.txt", "a");

    p.engine
        .register_compile("concat", "genfiles/out.txt", ["a.txt"], Concat::new("X"))
        .unwrap();

    let cancel = CancelToken::new();
    cancel.cancel();
    let err = p
        .engine
        .build_with(
            &["genfiles/out.txt"],
            &BuildContext::new(),
            &BuildOptions::new().cancel_token(cancel),
        )
        .unwrap_err();
    assert!(matches!(err, BuildError::Cancelled { .. }));
}

// A forced build bypasses freshness and reruns the capability.
#[test]
fn test_force_rebuild() {
    let p = TestProject::new();
    p.write("a.txt", "hello");

    let cap = Concat::new("X");
    p.engine
        .register_compile("concat", "genfiles/out.txt", ["a.txt"], cap.clone())
        .unwrap();
    let ctx = BuildContext::new();

    assert!(p.engine.build("genfiles/out.txt", &ctx).unwrap());
    assert!(!p.engine.build("genfiles/out.txt", &ctx).unwrap());
    assert_eq!(cap.calls(), 1);

    let rebuilt = p
        .engine
        .build_with(
            &["genfiles/out.txt"],
            &ctx,
            &BuildOptions::new().force(true),
        )
        .unwrap();
    assert_eq!(rebuilt, vec!["genfiles/out.txt"]);
    assert_eq!(cap.calls(), 2);

    // The forced rebuild refreshed the sidecar; the next plain build is
    // a no-op again.
    assert!(!p.engine.build("genfiles/out.txt", &ctx).unwrap());
    assert_eq!(cap.calls(), 2);
}

// Rule-level non-input deps are built first but do not feed the
// capability.
#[test]
fn test_non_input_deps_are_built_first() {
    let p = TestProject::new();
    p.write("a.txt", "a");
    p.write("marker_src.txt", "m");

    let marker_cap = Concat::new("-marker");
    let main_cap = Concat::new("-main");
    p.engine
        .register_compile(
            "marker",
            "genfiles/marker.txt",
            ["marker_src.txt"],
            marker_cap.clone(),
        )
        .unwrap();
    p.engine
        .register(
            Rule::new("main", "genfiles/main.txt", ["a.txt"], main_cap.clone())
                .unwrap()
                .with_non_input_deps(["genfiles/marker.txt"]),
        )
        .unwrap();

    p.engine
        .build("genfiles/main.txt", &BuildContext::new())
        .unwrap();
    // The dep got built, but its contents never reached the capability.
    assert_eq!(p.read("genfiles/marker.txt"), "m-marker");
    assert_eq!(p.read("genfiles/main.txt"), "a-main");
    assert_eq!(marker_cap.calls(), 1);
}

/// Shells out for its transformation.
#[cfg(unix)]
struct ShellUpper;

#[cfg(unix)]
impl Capability for ShellUpper {
    fn version(&self) -> u32 {
        1
    }

    fn build(
        &self,
        cx: &BuildCx<'_>,
        output: &str,
        inputs: &[String],
        _changed: &[String],
    ) -> Result<(), BuildError> {
        cx.call(&[
            "sh".to_string(),
            "-c".to_string(),
            format!(
                "tr a-z A-Z < {} > {}",
                inputs[0],
                output
            ),
        ])
    }
}

#[cfg(unix)]
#[test]
fn test_subprocess_capability() {
    let p = TestProject::new();
    p.write("a.txt", "quiet");

    p.engine
        .register_compile("upper", "genfiles/loud.txt", ["a.txt"], Arc::new(ShellUpper))
        .unwrap();

    p.engine
        .build("genfiles/loud.txt", &BuildContext::new())
        .unwrap();
    assert_eq!(p.read("genfiles/loud.txt"), "QUIET");
}

/// Runs a subprocess that always fails, to exercise stderr capture.
#[cfg(unix)]
struct ShellFail;

#[cfg(unix)]
impl Capability for ShellFail {
    fn version(&self) -> u32 {
        1
    }

    fn build(
        &self,
        cx: &BuildCx<'_>,
        _output: &str,
        _inputs: &[String],
        _changed: &[String],
    ) -> Result<(), BuildError> {
        cx.call(&["sh", "-c", "echo compile exploded >&2; exit 1"])
    }
}

#[cfg(unix)]
#[test]
fn test_subprocess_failure_carries_stderr() {
    let p = TestProject::new();
    p.write("a.txt", "a");

    p.engine
        .register_compile("boom", "genfiles/out.txt", ["a.txt"], Arc::new(ShellFail))
        .unwrap();

    let err = p
        .engine
        .build("genfiles/out.txt", &BuildContext::new())
        .unwrap_err();
    match err {
        BuildError::BuildFailed { stderr, argv, .. } => {
            assert!(stderr.unwrap().contains("compile exploded"));
            assert_eq!(argv.unwrap()[0], "sh");
        }
        other => panic!("expected BuildFailed, got {other:?}"),
    }
}

// Two engines in one process stay fully independent.
#[test]
fn test_engines_are_isolated() {
    let p1 = TestProject::new();
    let p2 = TestProject::new();
    p1.write("a.txt", "one");
    p2.write("a.txt", "two");

    p1.engine
        .register_compile("concat", "genfiles/out.txt", ["a.txt"], Concat::new(""))
        .unwrap();
    p2.engine
        .register_compile("concat", "genfiles/out.txt", ["a.txt"], Concat::new(""))
        .unwrap();

    let ctx = BuildContext::new();
    p1.engine.build("genfiles/out.txt", &ctx).unwrap();
    p2.engine.build("genfiles/out.txt", &ctx).unwrap();

    assert_eq!(p1.read("genfiles/out.txt"), "one");
    assert_eq!(p2.read("genfiles/out.txt"), "two");
}
