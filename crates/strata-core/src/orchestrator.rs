//! Recursive, depth-first extraction.
//!
//! ## Algorithm Overview
//!
//! For every node, starting with the top-level input:
//!
//! 1. Ask the [`FormatFinder`] for the best addon; stop this branch on no match
//! 2. Pull artifacts from the winner's extractor one at a time
//! 3. Copy the node's placement stack into each artifact
//! 4. Persist artifacts flagged Output (and not Temporary) that have a
//!    complete output path, and mirror them into the virtual tree if one is
//!    attached
//! 5. Recurse into artifacts flagged ProcessFurther before pulling the next
//!
//! Nesting depth is driven by the data. There is no cycle detection; an
//! optional depth cap stops descending without failing the run.

use crate::addon::{FormatFinder, MatchedAddon};
use crate::error::Result;
use crate::sink::ArtifactSink;
use crate::source::DataSource;
use crate::vfs::VfsDirectory;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, trace, warn};

/// Configuration for the orchestrator
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Deepest node fed into detection (input is depth 0; `None` = unbounded)
    pub max_depth: Option<usize>,
    /// Hand persist-worthy artifacts to the sink
    pub write_artifacts: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_depth: None,
            write_artifacts: true,
        }
    }
}

impl OrchestratorConfig {
    /// Creates a new config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the depth cap
    pub fn max_depth(mut self, max: Option<usize>) -> Self {
        self.max_depth = max;
        self
    }

    /// Sets whether artifacts reach the sink
    pub fn write_artifacts(mut self, write: bool) -> Self {
        self.write_artifacts = write;
        self
    }
}

/// Counters for one run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractionReport {
    /// Nodes fed into detection
    pub nodes_visited: usize,
    /// Nodes some addon recognised
    pub nodes_matched: usize,
    /// Artifacts produced by extractors
    pub artifacts_produced: usize,
    /// Artifacts handed to the sink
    pub artifacts_written: usize,
    /// Persist-worthy artifacts lacking a base directory or file name
    pub artifacts_unplaced: usize,
    /// Nodes attached to the virtual tree
    pub vfs_nodes: usize,
    /// Artifacts not processed further because of the depth cap
    pub depth_capped: usize,
    /// Deepest node visited
    pub max_depth_seen: usize,
}

/// Drives detection and extraction recursively
pub struct Orchestrator<'f, S> {
    finder: &'f FormatFinder,
    sink: S,
    config: OrchestratorConfig,
    report: ExtractionReport,
}

/// Per-run placement state for the virtual tree
struct Mirror<'v> {
    mount: &'v mut VfsDirectory,
    root: Option<PathBuf>,
}

impl<'f, S: ArtifactSink> Orchestrator<'f, S> {
    /// Creates an orchestrator with default configuration
    pub fn new(finder: &'f FormatFinder, sink: S) -> Self {
        Self {
            finder,
            sink,
            config: OrchestratorConfig::default(),
            report: ExtractionReport::default(),
        }
    }

    /// Replaces the configuration
    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    /// The sink artifacts are written to
    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Consumes the orchestrator, returning its sink
    pub fn into_sink(self) -> S {
        self.sink
    }

    /// Extracts `input` and everything nested in it
    pub fn run(&mut self, input: &DataSource) -> Result<ExtractionReport> {
        self.report = ExtractionReport::default();
        self.process(input, 0, None)?;
        Ok(self.report.clone())
    }

    /// Like [`Orchestrator::run`], also mirroring artifacts below
    /// `vfs_root/<input name>`
    pub fn run_with_vfs(
        &mut self,
        input: &DataSource,
        vfs_root: &mut VfsDirectory,
    ) -> Result<ExtractionReport> {
        self.report = ExtractionReport::default();
        let mut mirror = Mirror {
            mount: vfs_root.mount(input.name()),
            root: input.base_directory().map(Path::to_path_buf),
        };
        self.process(input, 0, Some(&mut mirror))?;
        Ok(self.report.clone())
    }

    fn process(
        &mut self,
        source: &DataSource,
        depth: usize,
        mirror: Option<&mut Mirror<'_>>,
    ) -> Result<()> {
        self.process_node(source, depth, mirror)
            .map_err(|e| e.in_node(source.name()))
    }

    fn process_node(
        &mut self,
        source: &DataSource,
        depth: usize,
        mut mirror: Option<&mut Mirror<'_>>,
    ) -> Result<()> {
        self.report.nodes_visited += 1;
        self.report.max_depth_seen = self.report.max_depth_seen.max(depth);

        let Some(found) = self.finder.find(source)? else {
            trace!("'{}' at depth {} is a leaf", source.name(), depth);
            return Ok(());
        };
        self.report.nodes_matched += 1;

        let addon = found.addon();
        let mut extractor = found.into_extractor();
        let artifacts = extractor.extract(source)?;

        for artifact in artifacts {
            let mut artifact = artifact?;
            self.report.artifacts_produced += 1;
            artifact.inherit_placement(source);

            if artifact.is_persistable() {
                self.place(&artifact, addon, mirror.as_deref_mut())?;
            }

            if !artifact.wants_processing() {
                continue;
            }
            if self.config.max_depth.is_some_and(|max| depth + 1 > max) {
                warn!(
                    "Not descending into '{}': depth {} exceeds the cap",
                    artifact.name(),
                    depth + 1
                );
                self.report.depth_capped += 1;
                continue;
            }
            self.process(&artifact, depth + 1, mirror.as_deref_mut())?;
        }

        Ok(())
    }

    fn place(
        &mut self,
        artifact: &DataSource,
        addon: MatchedAddon<'f>,
        mirror: Option<&mut Mirror<'_>>,
    ) -> Result<()> {
        let path = artifact.output_path();

        match &path {
            Some(path) if self.config.write_artifacts => {
                debug!("Placing '{}' at {}", artifact.name(), path.display());
                self.sink.store(path, artifact)?;
                self.report.artifacts_written += 1;
            }
            Some(_) => {}
            None => {
                debug!("'{}' has no output path, not written", artifact.name());
                self.report.artifacts_unplaced += 1;
            }
        }

        let Some(mirror) = mirror else {
            return Ok(());
        };

        match addon.create_vfs_node(artifact) {
            Ok(node) => {
                let relative = path
                    .as_deref()
                    .and_then(Path::parent)
                    .map(|dir| relative_to(dir, mirror.root.as_deref()))
                    .unwrap_or_default();
                mirror.mount.directory_at(&relative).insert(node);
                self.report.vfs_nodes += 1;
            }
            Err(e) if e.is_unsupported() => {
                trace!("No virtual node for '{}': {}", artifact.name(), e);
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }
}

/// `dir` relative to `root`, keeping only normal components
fn relative_to(dir: &Path, root: Option<&Path>) -> PathBuf {
    let stripped = root
        .and_then(|root| dir.strip_prefix(root).ok())
        .unwrap_or(dir);
    stripped
        .components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addon::{Artifacts, Detection, Extractor, FormatAddon};
    use crate::error::Error;
    use crate::sink::MemorySink;
    use crate::source::{Meta, SourceFlags};
    use crate::vfs::VfsNode;
    use pretty_assertions::assert_eq;

    /// Test container: `NEST` + child payload; child is nested once more
    /// while the payload starts with `NEST` too.
    struct Nest;

    struct NestExtractor;

    impl Extractor for NestExtractor {
        fn extract<'a>(&'a mut self, source: &'a DataSource) -> Result<Artifacts<'a>> {
            let inner = source.slice("inner", 4..source.len()).unwrap_or_else(|| {
                DataSource::new("inner", Vec::new())
            });
            let inner = inner
                .with_output_name(format!("{}.inner", source.name()))
                .with_flags(SourceFlags::PROCESS_FURTHER)
                .with_meta(Meta::OutputDirectoryName(format!("{}.d", source.name())));
            let note = DataSource::new("note", b"temp".to_vec())
                .with_output_name("note.txt")
                .with_flags(SourceFlags::TEMPORARY);
            Ok(Box::new(vec![Ok(inner), Ok(note)].into_iter()))
        }
    }

    impl FormatAddon for Nest {
        type Context = ();
        type Extractor = NestExtractor;

        fn id(&self) -> &str {
            "nest"
        }

        fn detect(&self, source: &DataSource) -> Result<Detection<()>> {
            let score = if source.data().starts_with(b"NEST") { 100 } else { 0 };
            Ok(Detection::new(score, ()))
        }

        fn create_extractor(&self, _detection: Detection<()>) -> NestExtractor {
            NestExtractor
        }

        fn create_vfs_node(&self, artifact: &DataSource) -> Result<VfsNode> {
            let name = artifact.output_file_name().unwrap_or(artifact.name());
            Ok(VfsNode::file(name, artifact.bytes().clone()))
        }
    }

    /// Splits on `|`; children are written but only `NEST` ones recurse
    struct Split;

    struct SplitExtractor;

    impl Extractor for SplitExtractor {
        fn extract<'a>(&'a mut self, source: &'a DataSource) -> Result<Artifacts<'a>> {
            let body = &source.data()[5..];
            Ok(Box::new(body.split(|&b| b == b'|').enumerate().map(
                |(i, part)| {
                    let mut child = DataSource::new(format!("part{}", i), part.to_vec())
                        .with_output_name(format!("part{}.bin", i));
                    if part.starts_with(b"NEST") {
                        child.add_flags(SourceFlags::PROCESS_FURTHER);
                    }
                    Ok(child)
                },
            )))
        }
    }

    impl FormatAddon for Split {
        type Context = ();
        type Extractor = SplitExtractor;

        fn id(&self) -> &str {
            "split"
        }

        fn detect(&self, source: &DataSource) -> Result<Detection<()>> {
            let score = if source.data().starts_with(b"SPLIT") { 100 } else { 0 };
            Ok(Detection::new(score, ()))
        }

        fn create_extractor(&self, _detection: Detection<()>) -> SplitExtractor {
            SplitExtractor
        }
    }

    /// Fails after yielding one artifact
    struct Broken;

    struct BrokenExtractor;

    impl Extractor for BrokenExtractor {
        fn extract<'a>(&'a mut self, _source: &'a DataSource) -> Result<Artifacts<'a>> {
            let ok = DataSource::new("first", b"1".to_vec()).with_output_name("first.bin");
            Ok(Box::new(
                vec![
                    Ok(ok),
                    Err(Error::malformed_container("broken", "segment 2 out of order")),
                ]
                .into_iter(),
            ))
        }
    }

    impl FormatAddon for Broken {
        type Context = ();
        type Extractor = BrokenExtractor;

        fn id(&self) -> &str {
            "broken"
        }

        fn detect(&self, source: &DataSource) -> Result<Detection<()>> {
            let score = if source.data().starts_with(b"BRKN") { 100 } else { 0 };
            Ok(Detection::new(score, ()))
        }

        fn create_extractor(&self, _detection: Detection<()>) -> BrokenExtractor {
            BrokenExtractor
        }

        fn create_vfs_node(&self, _artifact: &DataSource) -> Result<VfsNode> {
            Err(Error::internal("vfs backend unavailable"))
        }
    }

    fn finder() -> FormatFinder {
        FormatFinder::new()
            .with(Nest)
            .and_then(|f| f.with(Split))
            .and_then(|f| f.with(Broken))
            .unwrap()
    }

    fn input(data: &[u8]) -> DataSource {
        DataSource::input("fw.bin", data.to_vec(), "/out")
    }

    #[test]
    fn test_recursive_placement() {
        let finder = finder();
        let mut orchestrator = Orchestrator::new(&finder, MemorySink::new());
        let report = orchestrator.run(&input(b"NESTNESTleaf")).unwrap();

        let sink = orchestrator.into_sink();
        let paths: Vec<_> = sink.files().keys().cloned().collect();
        assert_eq!(
            paths,
            vec![
                PathBuf::from("/out/fw.bin.d/fw.bin.inner"),
                PathBuf::from("/out/fw.bin.d/inner.d/inner.inner"),
            ]
        );
        assert_eq!(
            sink.get("/out/fw.bin.d/inner.d/inner.inner").unwrap().as_ref(),
            b"leaf"
        );
        assert_eq!(report.nodes_visited, 3);
        assert_eq!(report.nodes_matched, 2);
        assert_eq!(report.max_depth_seen, 2);
        // Temporary notes are never written
        assert_eq!(report.artifacts_produced, 4);
        assert_eq!(report.artifacts_written, 2);
    }

    #[test]
    fn test_recursion_gated_by_flag() {
        let finder = finder();
        let mut orchestrator = Orchestrator::new(&finder, MemorySink::new());
        let report = orchestrator.run(&input(b"SPLITNESTx|plain")).unwrap();

        // part0 is written and recursed into, part1 is only written
        let sink = orchestrator.into_sink();
        assert!(sink.get("/out/part0.bin").is_some());
        assert!(sink.get("/out/part1.bin").is_some());
        assert!(sink.get("/out/part0.d/part0.inner").is_some());
        assert_eq!(report.nodes_visited, 3);
        assert_eq!(report.nodes_matched, 2);
    }

    #[test]
    fn test_no_match_is_a_leaf() {
        let finder = finder();
        let mut orchestrator = Orchestrator::new(&finder, MemorySink::new());
        let report = orchestrator.run(&input(b"plain data")).unwrap();

        assert_eq!(report.nodes_visited, 1);
        assert_eq!(report.nodes_matched, 0);
        assert!(orchestrator.sink().is_empty());
    }

    #[test]
    fn test_unplaced_artifacts_still_recurse() {
        let finder = finder();
        let mut orchestrator = Orchestrator::new(&finder, MemorySink::new());
        let rootless = DataSource::new("fw.bin", b"NESTNESTleaf".to_vec());
        let report = orchestrator.run(&rootless).unwrap();

        assert!(orchestrator.sink().is_empty());
        assert_eq!(report.artifacts_unplaced, 2);
        assert_eq!(report.nodes_visited, 3);
    }

    #[test]
    fn test_depth_cap() {
        let finder = finder();
        let config = OrchestratorConfig::new().max_depth(Some(1));
        let mut orchestrator = Orchestrator::new(&finder, MemorySink::new()).with_config(config);
        let report = orchestrator.run(&input(b"NESTNESTNESTleaf")).unwrap();

        assert_eq!(report.nodes_visited, 2);
        assert_eq!(report.depth_capped, 1);
        // The capped artifact is still written
        assert_eq!(report.artifacts_written, 2);
    }

    #[test]
    fn test_extraction_error_names_node() {
        let finder = finder();
        let mut orchestrator = Orchestrator::new(&finder, MemorySink::new());
        let err = orchestrator.run(&input(b"NESTBRKN")).unwrap_err();

        match err {
            Error::Node { node, source } => {
                assert_eq!(node, "inner");
                assert!(matches!(*source, Error::MalformedContainer { .. }));
            }
            other => panic!("unexpected error: {other}"),
        }
        // Work done before the failure stays in the sink
        assert!(orchestrator.sink().get("/out/fw.bin.d/fw.bin.inner").is_some());
    }

    #[test]
    fn test_vfs_mirror() {
        let finder = finder();
        let mut root = VfsDirectory::new("");
        let config = OrchestratorConfig::new().write_artifacts(false);
        let mut orchestrator = Orchestrator::new(&finder, MemorySink::new()).with_config(config);
        let report = orchestrator
            .run_with_vfs(&input(b"NESTNESTleaf"), &mut root)
            .unwrap();

        assert!(orchestrator.sink().is_empty());
        assert_eq!(report.vfs_nodes, 2);
        assert!(root.get("fw.bin/fw.bin.d/fw.bin.inner").is_some());
        assert_eq!(
            root.get("fw.bin/fw.bin.d/inner.d/inner.inner")
                .and_then(VfsNode::as_file)
                .map(|b| b.to_vec()),
            Some(b"leaf".to_vec())
        );
    }

    #[test]
    fn test_unsupported_vfs_is_skipped() {
        let finder = finder();
        let mut root = VfsDirectory::new("");
        let mut orchestrator = Orchestrator::new(&finder, MemorySink::new());
        let report = orchestrator
            .run_with_vfs(&input(b"SPLITa|b"), &mut root)
            .unwrap();

        assert_eq!(report.artifacts_written, 2);
        assert_eq!(report.vfs_nodes, 0);
        assert_eq!(root.file_count(), 0);
    }

    #[test]
    fn test_vfs_failure_aborts() {
        let finder = finder();
        let mut root = VfsDirectory::new("");
        let mut orchestrator = Orchestrator::new(&finder, MemorySink::new());
        let err = orchestrator
            .run_with_vfs(&input(b"BRKN"), &mut root)
            .unwrap_err();

        assert!(err.to_string().contains("vfs backend unavailable"));
    }

    #[test]
    fn test_relative_to() {
        assert_eq!(
            relative_to(Path::new("/out/a/b"), Some(Path::new("/out"))),
            PathBuf::from("a/b")
        );
        assert_eq!(
            relative_to(Path::new("/elsewhere/a"), Some(Path::new("/out"))),
            PathBuf::from("elsewhere/a")
        );
    }
}
