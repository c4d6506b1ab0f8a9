//! Loading of script manifests and relational evidence from disk.
//!
//! A manifest is a JSON document listing script images with their code as
//! hex. The input may be one manifest, a zip bundle of manifests, or a
//! directory tree; listings are sorted so repeated scans load the same
//! scripts in the same order.

use std::collections::BTreeMap;
use std::fs;
use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};
use jsonschema::JSONSchema;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, warn};
use zip::ZipArchive;

use crate::batch::ScriptFailure;
use crate::decoder::ScriptImage;
use crate::error::CorpusError;
use crate::evidence::{EvidenceTable, RelationalEvidence};

#[derive(Deserialize)]
struct Manifest {
    scripts: Vec<ManifestScript>,
}

#[derive(Deserialize)]
struct ManifestScript {
    id: u16,
    owner: String,
    #[serde(default)]
    arg_count: u8,
    #[serde(default)]
    local_count: u8,
    instruction_count: usize,
    code: String,
}

#[derive(Deserialize)]
struct EvidenceDocument {
    scripts: Vec<EvidenceEntry>,
}

#[derive(Deserialize)]
struct EvidenceEntry {
    id: u16,
    #[serde(flatten)]
    evidence: RelationalEvidence,
}

/// Scripts read from the input. A script whose code cannot be read is
/// rejected on its own and the rest of its manifest still loads.
#[derive(Debug, Default)]
pub struct LoadedCorpus {
    pub images: Vec<ScriptImage>,
    pub rejected: Vec<ScriptFailure>,
}

impl LoadedCorpus {
    pub fn len(&self) -> usize {
        self.images.len() + self.rejected.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn extend(&mut self, other: LoadedCorpus) {
        self.images.extend(other.images);
        self.rejected.extend(other.rejected);
    }
}

/// Load every script reachable from `input`, ordered by id.
pub fn load_corpus(input: &Path) -> Result<LoadedCorpus> {
    let mut corpus = LoadedCorpus::default();
    scan_path(input, true, &mut corpus)?;

    let loaded = corpus
        .images
        .iter()
        .map(|image| (image.id, &image.owner))
        .chain(corpus.rejected.iter().map(|failure| (failure.id, &failure.owner)));
    let mut owners: BTreeMap<u16, &String> = BTreeMap::new();
    for (id, owner) in loaded {
        if let Some(first) = owners.insert(id, owner) {
            return Err(CorpusError::DuplicateScript {
                id,
                first: first.clone(),
                second: owner.clone(),
            }
            .into());
        }
    }

    corpus.images.sort_by_key(|image| image.id);
    corpus.rejected.sort_by_key(|failure| failure.id);
    debug!(
        scripts = corpus.images.len(),
        rejected = corpus.rejected.len(),
        input = %input.display(),
        "loaded corpus"
    );
    Ok(corpus)
}

/// Load relational evidence from a JSON document.
pub fn load_evidence(path: &Path) -> Result<EvidenceTable> {
    let data = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let value: Value = serde_json::from_slice(&data)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    validate(&path.display().to_string(), &evidence_schema(), &value)?;
    let document: EvidenceDocument = serde_json::from_value(value)
        .with_context(|| format!("failed to read evidence from {}", path.display()))?;
    Ok(document
        .scripts
        .into_iter()
        .map(|entry| (entry.id, entry.evidence))
        .collect())
}

/// Parse one manifest document. `source` names it in errors.
///
/// A malformed document fails as a whole; a script with bad hex is only
/// rejected.
pub fn parse_manifest(source: &str, data: &[u8]) -> Result<LoadedCorpus> {
    let value: Value =
        serde_json::from_slice(data).with_context(|| format!("failed to parse {source}"))?;
    validate(source, &manifest_schema(), &value)?;
    let manifest: Manifest = serde_json::from_value(value)
        .with_context(|| format!("failed to read scripts from {source}"))?;

    let mut corpus = LoadedCorpus::default();
    for script in manifest.scripts {
        match hex::decode(script.code.trim()) {
            Ok(code) => corpus.images.push(ScriptImage {
                id: script.id,
                owner: script.owner,
                arg_count: script.arg_count,
                local_count: script.local_count,
                instruction_count: script.instruction_count,
                code,
            }),
            Err(err) => {
                let error = CorpusError::InvalidHex {
                    id: script.id,
                    source: err,
                };
                warn!(document = source, error = %error, "rejecting script");
                corpus.rejected.push(ScriptFailure {
                    id: script.id,
                    owner: script.owner,
                    error: error.to_string(),
                });
            }
        }
    }
    Ok(corpus)
}

fn scan_path(path: &Path, strict: bool, corpus: &mut LoadedCorpus) -> Result<()> {
    if path.is_dir() {
        return scan_dir(path, corpus);
    }

    let extension = path.extension().and_then(|ext| ext.to_str()).unwrap_or("");
    match extension {
        "json" => scan_manifest_file(path, corpus),
        "zip" => scan_zip_file(path, corpus),
        _ => {
            if strict {
                anyhow::bail!("unsupported input file: {}", path.display())
            } else {
                debug!(path = %path.display(), "skipping unsupported file");
                Ok(())
            }
        }
    }
}

fn scan_dir(path: &Path, corpus: &mut LoadedCorpus) -> Result<()> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(path)
        .with_context(|| format!("failed to read directory {}", path.display()))?
    {
        let entry =
            entry.with_context(|| format!("failed to read entry under {}", path.display()))?;
        entries.push(entry.path());
    }

    entries.sort_by(|a, b| path_key(a).cmp(&path_key(b)));

    for entry in entries {
        if entry.is_dir() {
            scan_dir(&entry, corpus)?;
        } else {
            scan_path(&entry, false, corpus)?;
        }
    }

    Ok(())
}

fn scan_manifest_file(path: &Path, corpus: &mut LoadedCorpus) -> Result<()> {
    let data = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let scripts = parse_manifest(&path.display().to_string(), &data)?;
    debug!(path = %path.display(), scripts = scripts.len(), "read manifest");
    corpus.extend(scripts);
    Ok(())
}

fn scan_zip_file(path: &Path, corpus: &mut LoadedCorpus) -> Result<()> {
    let file = fs::File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut archive =
        ZipArchive::new(file).with_context(|| format!("failed to read {}", path.display()))?;

    let mut entry_names = Vec::new();
    for index in 0..archive.len() {
        let entry = archive
            .by_index(index)
            .with_context(|| format!("failed to read {}", path.display()))?;
        if entry.is_dir() {
            continue;
        }
        let name = entry.name().to_string();
        if name.ends_with(".json") {
            entry_names.push(name);
        }
    }

    entry_names.sort();

    for name in entry_names {
        let mut entry = archive
            .by_name(&name)
            .with_context(|| format!("failed to read {}:{}", path.display(), name))?;
        let mut data = Vec::new();
        entry
            .read_to_end(&mut data)
            .with_context(|| format!("failed to read {}:{}", path.display(), name))?;
        let scripts = parse_manifest(&zip_entry_uri(path, &name), &data)?;
        debug!(entry = %name, scripts = scripts.len(), "read bundled manifest");
        corpus.extend(scripts);
    }

    Ok(())
}

fn validate(document: &str, schema: &Value, instance: &Value) -> Result<()> {
    let compiled = JSONSchema::compile(schema)
        .map_err(|err| anyhow::anyhow!("invalid schema for {document}: {err}"))?;
    let details = match compiled.validate(instance) {
        Ok(()) => return Ok(()),
        Err(errors) => errors
            .map(|err| format!("{}: {err}", err.instance_path))
            .collect::<Vec<_>>()
            .join("; "),
    };
    Err(CorpusError::SchemaViolation {
        document: document.to_string(),
        details,
    }
    .into())
}

fn manifest_schema() -> Value {
    json!({
        "type": "object",
        "required": ["scripts"],
        "properties": {
            "scripts": {
                "type": "array",
                "items": {
                    "type": "object",
                    "required": ["id", "owner", "instruction_count", "code"],
                    "properties": {
                        "id": { "type": "integer", "minimum": 0, "maximum": 65535 },
                        "owner": { "type": "string" },
                        "arg_count": { "type": "integer", "minimum": 0, "maximum": 255 },
                        "local_count": { "type": "integer", "minimum": 0, "maximum": 255 },
                        "instruction_count": { "type": "integer", "minimum": 0 },
                        "code": { "type": "string" }
                    }
                }
            }
        }
    })
}

fn evidence_schema() -> Value {
    json!({
        "type": "object",
        "required": ["scripts"],
        "properties": {
            "scripts": {
                "type": "array",
                "items": {
                    "type": "object",
                    "required": ["id"],
                    "properties": {
                        "id": { "type": "integer", "minimum": 0, "maximum": 65535 },
                        "lifecycle_hook": {
                            "enum": ["init", "main", "cleanup", "load", "reset", null]
                        },
                        "interaction": { "enum": ["action", "guard", null] },
                        "inbound_calls": { "type": ["integer", "null"], "minimum": 0 },
                        "observed_yield": { "type": "boolean" },
                        "max_iterations": { "type": ["integer", "null"], "minimum": 0 }
                    }
                }
            }
        }
    })
}

fn zip_entry_uri(zip_path: &Path, entry_name: &str) -> String {
    format!("zip:{}!/{}", zip_path.to_string_lossy(), entry_name)
}

fn path_key(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evidence::{InteractionBinding, LifecycleHook};
    use std::io::Write;
    use zip::ZipWriter;
    use zip::write::SimpleFileOptions;

    fn manifest(scripts: &[(u16, &str)]) -> String {
        let scripts: Vec<Value> = scripts
            .iter()
            .map(|(id, owner)| {
                json!({
                    "id": id,
                    "owner": owner,
                    "arg_count": 1,
                    "instruction_count": 1,
                    "code": "0200fffe0000010000020907"
                })
            })
            .collect();
        json!({ "scripts": scripts }).to_string()
    }

    #[test]
    fn loads_single_manifest() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("corpus.json");
        fs::write(&path, manifest(&[(0x1001, "sofa"), (0x1000, "sofa")])).expect("write");

        let images = load_corpus(&path).expect("load").images;

        assert_eq!(2, images.len());
        assert_eq!(0x1000, images[0].id);
        assert_eq!(12, images[0].code.len());
        assert_eq!(1, images[0].arg_count);
        assert_eq!(0, images[0].local_count);
    }

    #[test]
    fn directory_scan_skips_other_files_and_recurses() {
        let dir = tempfile::tempdir().expect("temp dir");
        let nested = dir.path().join("objects");
        fs::create_dir_all(&nested).expect("mkdir");
        fs::write(dir.path().join("a.json"), manifest(&[(0x0100, "global")])).expect("write");
        fs::write(nested.join("b.json"), manifest(&[(0x1000, "chair")])).expect("write");
        fs::write(dir.path().join("notes.txt"), "not a manifest").expect("write");

        let images = load_corpus(dir.path()).expect("load").images;

        let ids: Vec<u16> = images.iter().map(|image| image.id).collect();
        assert_eq!(vec![0x0100, 0x1000], ids);
    }

    #[test]
    fn zip_bundle_is_read_in_entry_order() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("bundle.zip");
        let file = fs::File::create(&path).expect("create zip");
        let mut writer = ZipWriter::new(file);
        for (name, id) in [("z.json", 0x2001u16), ("a.json", 0x2000u16)] {
            writer
                .start_file(name, SimpleFileOptions::default())
                .expect("start entry");
            writer
                .write_all(manifest(&[(id, "group")]).as_bytes())
                .expect("write entry");
        }
        writer
            .start_file("readme.txt", SimpleFileOptions::default())
            .expect("start entry");
        writer.write_all(b"ignored").expect("write entry");
        writer.finish().expect("finish zip");

        let images = load_corpus(&path).expect("load").images;

        assert_eq!(2, images.len());
        assert_eq!(0x2000, images[0].id);
    }

    #[test]
    fn unsupported_top_level_input_is_rejected() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("corpus.iff");
        fs::write(&path, b"IFF").expect("write");
        assert!(load_corpus(&path).is_err());
    }

    #[test]
    fn schema_violation_is_reported_with_document_name() {
        let err = parse_manifest("bad.json", br#"{"scripts":[{"id":1,"owner":"x"}]}"#)
            .expect_err("missing fields");
        let corpus = err.downcast_ref::<CorpusError>().expect("corpus error");
        assert!(matches!(corpus, CorpusError::SchemaViolation { .. }));
        assert!(err.to_string().contains("bad.json"));
    }

    #[test]
    fn invalid_hex_rejects_only_that_script() {
        let data = br#"{"scripts":[
            {"id":7,"owner":"x","instruction_count":1,"code":"zz"},
            {"id":8,"owner":"y","instruction_count":1,"code":"0000fffd0000000000000000"}
        ]}"#;
        let corpus = parse_manifest("hex.json", data).expect("manifest loads");

        assert_eq!(2, corpus.len());
        assert_eq!(8, corpus.images[0].id);
        assert_eq!(1, corpus.rejected.len());
        assert_eq!(7, corpus.rejected[0].id);
        assert_eq!("x", corpus.rejected[0].owner);
        assert!(corpus.rejected[0].error.contains("0x0007"));
        assert!(corpus.rejected[0].error.contains("not valid hex"));
    }

    #[test]
    fn rejected_script_still_counts_for_duplicate_ids() {
        let dir = tempfile::tempdir().expect("temp dir");
        fs::write(dir.path().join("a.json"), manifest(&[(0x1000, "bed")])).expect("write");
        fs::write(
            dir.path().join("b.json"),
            r#"{"scripts":[{"id":4096,"owner":"lamp","instruction_count":1,"code":"0g"}]}"#,
        )
        .expect("write");

        let err = load_corpus(dir.path()).expect_err("duplicate");
        assert!(matches!(
            err.downcast_ref::<CorpusError>(),
            Some(CorpusError::DuplicateScript { id: 0x1000, .. })
        ));
    }

    #[test]
    fn duplicate_ids_across_manifests_are_rejected() {
        let dir = tempfile::tempdir().expect("temp dir");
        fs::write(dir.path().join("a.json"), manifest(&[(0x1000, "bed")])).expect("write");
        fs::write(dir.path().join("b.json"), manifest(&[(0x1000, "lamp")])).expect("write");

        let err = load_corpus(dir.path()).expect_err("duplicate");
        match err.downcast_ref::<CorpusError>() {
            Some(CorpusError::DuplicateScript { first, second, .. }) => {
                assert_eq!("bed", first);
                assert_eq!("lamp", second);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn evidence_file_loads_with_defaults() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("evidence.json");
        fs::write(
            &path,
            json!({
                "scripts": [
                    { "id": 4096, "lifecycle_hook": "main", "observed_yield": true },
                    { "id": 4097, "interaction": "action", "inbound_calls": 2 },
                    { "id": 4098, "inbound_calls": 999 }
                ]
            })
            .to_string(),
        )
        .expect("write");

        let table = load_evidence(&path).expect("load");

        assert_eq!(3, table.len());
        assert_eq!(Some(LifecycleHook::Main), table.get(0x1000).lifecycle_hook);
        assert!(table.get(0x1000).observed_yield);
        assert_eq!(Some(InteractionBinding::Action), table.get(0x1001).interaction);
        assert!(table.get(0x1002).is_interaction_guard());
        assert_eq!(RelationalEvidence::default(), *table.get(0x5555));
    }

    #[test]
    fn evidence_with_unknown_hook_fails_validation() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("evidence.json");
        fs::write(&path, r#"{"scripts":[{"id":1,"lifecycle_hook":"tick"}]}"#).expect("write");
        let err = load_evidence(&path).expect_err("invalid hook");
        assert!(matches!(
            err.downcast_ref::<CorpusError>(),
            Some(CorpusError::SchemaViolation { .. })
        ));
    }
}
