//! Columnar conversion pipeline
//!
//! A cached raw object is handed to the external converter, which writes
//! partition files striped across the configured devices plus a zonemap
//! index. For an object `KEY` in `BUCKET` the artifact set lives under
//! `DEVICE/BUCKET/dirname(KEY)/` on some device:
//!
//! ```text
//!   STEM.zmp      zonemap; its presence marks a complete artifact
//!   STEM.schema   schema the artifact was built with
//!   STEM.list     optional JSON list of partition file names
//! ```
//!
//! `STEM` is the key's base name with a trailing `.gz` and then its last
//! extension removed.

use crate::error::{ConvertError, ConvertResult};
use crate::tool::Tool;
use serde::Deserialize;
use serde_json::Value;
use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Zonemap file extension
pub const ZONEMAP_EXT: &str = "zmp";

/// Schema file extension
pub const SCHEMA_EXT: &str = "schema";

/// Manifest file extension
pub const MANIFEST_EXT: &str = "list";

/// CSV dialect
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct CsvSpec {
    #[serde(default, alias = "Delim")]
    pub delim: String,

    #[serde(default, alias = "Quote")]
    pub quote: String,

    #[serde(default, alias = "Escape")]
    pub escape: String,

    #[serde(default, alias = "Nullstr")]
    pub nullstr: String,

    #[serde(default, alias = "Header_line")]
    pub header_line: bool,
}

/// Input description sent with a pull, e.g.
/// `{"fmt":"csv","csvspec":{"delim":",","quote":"\"","escape":"\\","nullstr":"","header_line":true}}`
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct FormatSpec {
    #[serde(default, alias = "Fmt")]
    pub fmt: String,

    #[serde(default, alias = "Csvspec")]
    pub csvspec: CsvSpec,
}

impl FormatSpec {
    pub fn from_json(json: &str) -> ConvertResult<Self> {
        serde_json::from_str(json).map_err(|e| ConvertError::InvalidFormatSpec(e.to_string()))
    }

    pub fn parquet() -> Self {
        Self {
            fmt: "parquet".into(),
            csvspec: CsvSpec::default(),
        }
    }

    pub fn csv(csvspec: CsvSpec) -> Self {
        Self {
            fmt: "csv".into(),
            csvspec,
        }
    }

    pub fn is_parquet(&self) -> bool {
        self.fmt == "parquet"
    }

    /// Format-selection flags for the converter
    fn format_args(&self, schema_path: &Path) -> ConvertResult<Vec<OsString>> {
        let mut args: Vec<OsString> = match self.fmt.as_str() {
            "csv" => {
                let c = &self.csvspec;
                vec![
                    "-i".into(),
                    "csv".into(),
                    "-d".into(),
                    c.delim.clone().into(),
                    "-q".into(),
                    c.quote.clone().into(),
                    "-x".into(),
                    c.escape.clone().into(),
                    "-N".into(),
                    c.nullstr.clone().into(),
                    "-s".into(),
                    schema_path.into(),
                ]
            }
            "parquet" => vec![
                "-l".into(),
                "-i".into(),
                "parquet".into(),
                "-s".into(),
                schema_path.into(),
            ],
            other => return Err(ConvertError::UnsupportedFormat(other.to_string())),
        };
        if self.fmt == "csv" && self.csvspec.header_line {
            args.push("-H".into());
        }
        Ok(args)
    }
}

/// Strip a trailing `.gz`, then the last extension (leading dots kept)
pub fn stem(base: &str) -> &str {
    let base = base.strip_suffix(".gz").unwrap_or(base);
    match base.rfind('.') {
        Some(idx) if idx > 0 => &base[..idx],
        _ => base,
    }
}

/// Drives the external converter for one key at a time
#[derive(Debug, Clone)]
pub struct Converter {
    tool: Tool,
    devices: Vec<PathBuf>,
    rows_per_group: usize,
}

impl Converter {
    /// `rows_per_group == 0` leaves the converter's default in place
    pub fn new(tool: Tool, devices: Vec<PathBuf>, rows_per_group: usize) -> Self {
        Self {
            tool,
            devices,
            rows_per_group,
        }
    }

    pub fn tool(&self) -> &Tool {
        &self.tool
    }

    pub fn devices(&self) -> &[PathBuf] {
        &self.devices
    }

    /// `DEVICE/BUCKET/dirname(KEY)` for every device, in device order
    pub fn output_dirs(&self, bucket: &str, key: &str) -> Vec<PathBuf> {
        let key_dir = Path::new(key)
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty());
        self.devices
            .iter()
            .map(|dev| {
                let dir = dev.join(bucket);
                match key_dir {
                    Some(key_dir) => dir.join(key_dir),
                    None => dir,
                }
            })
            .collect()
    }

    /// Full argument list for converting `source`
    pub fn build_args(
        &self,
        bucket: &str,
        key: &str,
        source: &Path,
        schema_path: &Path,
        spec: &FormatSpec,
    ) -> ConvertResult<Vec<OsString>> {
        let mut args = spec.format_args(schema_path)?;
        if self.rows_per_group > 0 {
            args.push("-n".into());
            args.push(self.rows_per_group.to_string().into());
        }
        for dir in self.output_dirs(bucket, key) {
            args.push("-D".into());
            args.push(dir.into());
        }
        args.push(source.into());
        Ok(args)
    }

    /// Convert `source` and return the absolute zonemap path
    pub fn convert(
        &self,
        bucket: &str,
        key: &str,
        source: &Path,
        schema_path: &Path,
        spec: &FormatSpec,
    ) -> ConvertResult<PathBuf> {
        let args = self.build_args(bucket, key, source, schema_path, spec)?;
        for dir in self.output_dirs(bucket, key) {
            fs::create_dir_all(&dir).map_err(|source| ConvertError::Mkdir { path: dir, source })?;
        }

        let started = std::time::Instant::now();
        self.tool.run(&args)?;

        let zonemap = self
            .find_zonemap(bucket, key)
            .ok_or_else(|| ConvertError::ArtifactMissing {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })?;

        info!(
            bucket,
            key,
            zonemap = %zonemap.display(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Converted"
        );
        Ok(zonemap)
    }

    /// First `STEM.zmp` found scanning devices in order
    pub fn find_zonemap(&self, bucket: &str, key: &str) -> Option<PathBuf> {
        let base = Path::new(key).file_name()?.to_str()?;
        let name = format!("{}.{}", stem(base), ZONEMAP_EXT);

        self.output_dirs(bucket, key)
            .into_iter()
            .map(|dir| dir.join(&name))
            .find(|p| p.is_file())
            .map(|p| std::path::absolute(&p).unwrap_or(p))
    }
}

/// One column of a schema document
#[derive(Debug, Clone, Deserialize)]
struct ColumnDesc {
    #[serde(default, alias = "Name")]
    name: String,

    #[serde(default, rename = "type", alias = "Type")]
    kind: String,
}

/// Schema file stored beside a zonemap
pub fn schema_path_for(zonemap: &Path) -> PathBuf {
    zonemap.with_extension(SCHEMA_EXT)
}

/// Manifest file stored beside a zonemap
pub fn manifest_path_for(zonemap: &Path) -> PathBuf {
    zonemap.with_extension(MANIFEST_EXT)
}

/// Compare a requested schema with the one an artifact was built with
///
/// Parquet-origin artifacts match when column names and types agree in
/// order; everything else needs structural JSON equality. `Ok(false)` means
/// the artifact must be rebuilt.
pub fn check_schema(requested: &[u8], zonemap: &Path, spec: &FormatSpec) -> ConvertResult<bool> {
    let stored_path = schema_path_for(zonemap);
    let stored = fs::read(&stored_path).map_err(|e| ConvertError::Schema {
        which: "stored",
        reason: format!("cannot open {}: {}", stored_path.display(), e),
    })?;

    if spec.is_parquet() {
        let want = parse_columns(requested, "requested")?;
        let have = parse_columns(&stored, "stored")?;
        if want.len() != have.len() {
            debug!(want = want.len(), have = have.len(), "Schema column count differs");
            return Ok(false);
        }
        Ok(want
            .iter()
            .zip(&have)
            .all(|(a, b)| a.name == b.name && a.kind == b.kind))
    } else {
        let want = parse_json(requested, "requested")?;
        let have = parse_json(&stored, "stored")?;
        Ok(same_document(&want, &have))
    }
}

/// Structural equality with numbers compared by value, so `10` equals `10.0`
fn same_document(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        (Value::Array(xs), Value::Array(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| same_document(x, y))
        }
        (Value::Object(xs), Value::Object(ys)) => {
            xs.len() == ys.len()
                && xs
                    .iter()
                    .all(|(k, x)| ys.get(k).is_some_and(|y| same_document(x, y)))
        }
        _ => a == b,
    }
}

fn parse_columns(bytes: &[u8], which: &'static str) -> ConvertResult<Vec<ColumnDesc>> {
    serde_json::from_slice(bytes).map_err(|e| ConvertError::Schema {
        which,
        reason: e.to_string(),
    })
}

fn parse_json(bytes: &[u8], which: &'static str) -> ConvertResult<Value> {
    serde_json::from_slice(bytes).map_err(|e| ConvertError::Schema {
        which,
        reason: e.to_string(),
    })
}

/// Delete an artifact set: zonemap, schema, manifested parts, manifest
///
/// Files already gone are skipped, so repeating the call is a no-op.
/// Relative manifest entries are resolved against the zonemap's directory.
pub fn remove_artifact(zonemap: &Path) -> ConvertResult<()> {
    remove_if_present(zonemap)?;
    remove_if_present(&schema_path_for(zonemap))?;

    let manifest = manifest_path_for(zonemap);
    let content = match fs::read(&manifest) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(source) => return Err(ConvertError::Remove { path: manifest, source }),
    };
    let parts: Vec<PathBuf> =
        serde_json::from_slice(&content).map_err(|e| ConvertError::InvalidManifest {
            path: manifest.clone(),
            reason: e.to_string(),
        })?;

    let base = zonemap.parent().unwrap_or(Path::new(""));
    for part in &parts {
        remove_if_present(&base.join(part))?;
    }
    remove_if_present(&manifest)?;

    debug!(zonemap = %zonemap.display(), parts = parts.len(), "Removed artifact");
    Ok(())
}

fn remove_if_present(path: &Path) -> ConvertResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(ConvertError::Remove {
            path: path.to_path_buf(),
            source,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SCHEMA: &str = r#"[{"name":"id","type":"int64"},{"name":"price","type":"decimal","precision":10,"scale":2}]"#;

    fn converter(devices: Vec<PathBuf>) -> Converter {
        Converter::new(Tool::new("xrgdiv"), devices, 0)
    }

    fn strings(args: Vec<OsString>) -> Vec<String> {
        args.into_iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_stem() {
        assert_eq!(stem("a.csv"), "a");
        assert_eq!(stem("a.csv.gz"), "a");
        assert_eq!(stem("a.b.parquet"), "a.b");
        assert_eq!(stem("noext"), "noext");
        assert_eq!(stem(".hidden"), ".hidden");
        assert_eq!(stem("x.gz"), "x");
    }

    #[test]
    fn test_format_spec_parsing() {
        let spec = FormatSpec::from_json(
            r#"{"fmt":"csv","csvspec":{"delim":"|","quote":"'","escape":"\\","nullstr":"NULL","header_line":true}}"#,
        )
        .unwrap();
        assert_eq!(spec.csvspec.delim, "|");
        assert!(spec.csvspec.header_line);

        let legacy = FormatSpec::from_json(r#"{"Fmt":"parquet"}"#).unwrap();
        assert!(legacy.is_parquet());

        assert!(FormatSpec::from_json("{not json").is_err());
    }

    #[test]
    fn test_csv_args() {
        let conv = Converter::new(
            Tool::new("xrgdiv"),
            vec![PathBuf::from("/d1"), PathBuf::from("/d2")],
            8192,
        );
        let spec = FormatSpec::csv(CsvSpec {
            delim: ",".into(),
            quote: "\"".into(),
            escape: "\\".into(),
            nullstr: "".into(),
            header_line: true,
        });
        let args = conv
            .build_args(
                "b",
                "dir/a.csv",
                Path::new("/h/data/b/dir/a.csv"),
                Path::new("/s.json"),
                &spec,
            )
            .unwrap();

        assert_eq!(
            strings(args),
            vec![
                "-i", "csv", "-d", ",", "-q", "\"", "-x", "\\", "-N", "", "-s", "/s.json", "-H",
                "-n", "8192", "-D", "/d1/b/dir", "-D", "/d2/b/dir", "/h/data/b/dir/a.csv",
            ]
        );
    }

    #[test]
    fn test_parquet_args() {
        let conv = converter(vec![PathBuf::from("/d1")]);
        let args = conv
            .build_args(
                "b",
                "a.parquet",
                Path::new("/src/a.parquet"),
                Path::new("/s.json"),
                &FormatSpec::parquet(),
            )
            .unwrap();
        assert_eq!(
            strings(args),
            vec!["-l", "-i", "parquet", "-s", "/s.json", "-D", "/d1/b", "/src/a.parquet"]
        );
    }

    #[test]
    fn test_unsupported_format() {
        let conv = converter(vec![PathBuf::from("/d1")]);
        let spec = FormatSpec {
            fmt: "orc".into(),
            csvspec: CsvSpec::default(),
        };
        let err = conv
            .build_args("b", "a.orc", Path::new("/a"), Path::new("/s"), &spec)
            .unwrap_err();
        assert_eq!(err.to_string(), "file type orc not supported");
    }

    #[test]
    fn test_find_zonemap_scans_devices_in_order() {
        let dir = TempDir::new().unwrap();
        let d1 = dir.path().join("d1");
        let d2 = dir.path().join("d2");
        let conv = converter(vec![d1.clone(), d2.clone()]);
        assert!(conv.find_zonemap("b", "x/a.csv.gz").is_none());

        fs::create_dir_all(d2.join("b/x")).unwrap();
        fs::write(d2.join("b/x/a.zmp"), "z").unwrap();
        assert_eq!(conv.find_zonemap("b", "x/a.csv.gz").unwrap(), d2.join("b/x/a.zmp"));

        fs::create_dir_all(d1.join("b/x")).unwrap();
        fs::write(d1.join("b/x/a.zmp"), "z").unwrap();
        assert_eq!(conv.find_zonemap("b", "x/a.csv.gz").unwrap(), d1.join("b/x/a.zmp"));
    }

    fn artifact(dir: &Path, stored_schema: &str) -> PathBuf {
        let zonemap = dir.join("a.zmp");
        fs::write(&zonemap, "z").unwrap();
        fs::write(dir.join("a.schema"), stored_schema).unwrap();
        zonemap
    }

    #[test]
    fn test_check_schema_strict() {
        let dir = TempDir::new().unwrap();
        let zonemap = artifact(dir.path(), SCHEMA);
        let csv = FormatSpec::csv(CsvSpec::default());

        // Whitespace and key order do not matter, values do
        let reordered = r#"[ {"type":"int64","name":"id"},
            {"name":"price","type":"decimal","scale":2,"precision":10} ]"#;
        assert!(check_schema(reordered.as_bytes(), &zonemap, &csv).unwrap());

        let other_precision = SCHEMA.replace("10", "12");
        assert!(!check_schema(other_precision.as_bytes(), &zonemap, &csv).unwrap());

        // Integer and float spellings of the same number match
        let float_precision = SCHEMA.replace("10", "10.0").replace(":2}", ":2.0}");
        assert!(check_schema(float_precision.as_bytes(), &zonemap, &csv).unwrap());

        let extra_field = SCHEMA.replace("\"scale\":2", "\"scale\":2,\"nullable\":true");
        assert!(!check_schema(extra_field.as_bytes(), &zonemap, &csv).unwrap());
    }

    #[test]
    fn test_check_schema_loose_for_parquet() {
        let dir = TempDir::new().unwrap();
        let zonemap = artifact(dir.path(), SCHEMA);
        let parquet = FormatSpec::parquet();

        let other_precision = SCHEMA.replace("10", "12").replace("\"scale\":2", "\"scale\":4");
        assert!(check_schema(other_precision.as_bytes(), &zonemap, &parquet).unwrap());

        let renamed = SCHEMA.replace("price", "cost");
        assert!(!check_schema(renamed.as_bytes(), &zonemap, &parquet).unwrap());

        let retyped = SCHEMA.replace("int64", "int32");
        assert!(!check_schema(retyped.as_bytes(), &zonemap, &parquet).unwrap());

        let fewer = r#"[{"name":"id","type":"int64"}]"#;
        assert!(!check_schema(fewer.as_bytes(), &zonemap, &parquet).unwrap());
    }

    #[test]
    fn test_check_schema_errors() {
        let dir = TempDir::new().unwrap();
        let zonemap = dir.path().join("gone.zmp");
        let err = check_schema(SCHEMA.as_bytes(), &zonemap, &FormatSpec::parquet()).unwrap_err();
        assert!(matches!(err, ConvertError::Schema { which: "stored", .. }));

        let zonemap = artifact(dir.path(), SCHEMA);
        let err = check_schema(b"not json", &zonemap, &FormatSpec::parquet()).unwrap_err();
        assert!(matches!(err, ConvertError::Schema { which: "requested", .. }));
    }

    #[test]
    fn test_remove_artifact_with_manifest() {
        let dir = TempDir::new().unwrap();
        let zonemap = artifact(dir.path(), SCHEMA);
        let part_abs = dir.path().join("a.0.xrg");
        fs::write(&part_abs, "p0").unwrap();
        fs::write(dir.path().join("a.1.xrg"), "p1").unwrap();
        let manifest = format!(r#"["{}", "a.1.xrg", "a.2.xrg"]"#, part_abs.display());
        fs::write(dir.path().join("a.list"), manifest).unwrap();

        remove_artifact(&zonemap).unwrap();
        for name in ["a.zmp", "a.schema", "a.0.xrg", "a.1.xrg", "a.list"] {
            assert!(!dir.path().join(name).exists(), "{} still present", name);
        }

        // Second call on the now-absent set is a no-op
        remove_artifact(&zonemap).unwrap();
    }

    #[test]
    fn test_remove_artifact_propagates_removal_failure() {
        let dir = TempDir::new().unwrap();
        let zonemap = artifact(dir.path(), SCHEMA);
        // A non-empty directory where a part file is expected cannot be unlinked
        let blocker = dir.path().join("a.0.xrg");
        fs::create_dir_all(blocker.join("inner")).unwrap();
        fs::write(dir.path().join("a.list"), r#"["a.0.xrg"]"#).unwrap();

        let err = remove_artifact(&zonemap).unwrap_err();
        match err {
            ConvertError::Remove { path, .. } => assert_eq!(path, blocker),
            other => panic!("unexpected {:?}", other),
        }
        assert!(!zonemap.exists());
        assert!(dir.path().join("a.list").exists());
    }

    #[test]
    fn test_output_dirs_for_top_level_and_nested_keys() {
        let conv = converter(vec![PathBuf::from("/d1"), PathBuf::from("/d2")]);
        assert_eq!(
            conv.output_dirs("b", "a.csv"),
            vec![PathBuf::from("/d1/b"), PathBuf::from("/d2/b")]
        );
        assert_eq!(
            conv.output_dirs("b", "x/y/a.csv"),
            vec![PathBuf::from("/d1/b/x/y"), PathBuf::from("/d2/b/x/y")]
        );
        for dir in conv.output_dirs("b", "a.csv") {
            assert!(!dir.to_string_lossy().ends_with('/'));
        }
    }

    #[test]
    fn test_remove_artifact_bad_manifest() {
        let dir = TempDir::new().unwrap();
        let zonemap = artifact(dir.path(), SCHEMA);
        fs::write(dir.path().join("a.list"), "{oops").unwrap();

        let err = remove_artifact(&zonemap).unwrap_err();
        assert!(matches!(err, ConvertError::InvalidManifest { .. }));
        assert!(!zonemap.exists());
    }

    #[cfg(unix)]
    mod with_tool {
        use super::*;
        use std::os::unix::fs::PermissionsExt;
        use std::sync::OnceLock;

        /// Stand-in converter: writes STEM.zmp and STEM.schema into the
        /// first -D directory, fails for sources containing FAIL, and
        /// succeeds without output for sources containing NOZMP
        const SCRIPT: &str = r#"#!/bin/sh
schema=""; out=""; src=""
while [ $# -gt 0 ]; do
  case "$1" in
    -s) schema="$2"; shift 2 ;;
    -D) [ -z "$out" ] && out="$2"; shift 2 ;;
    -d|-q|-x|-N|-i|-n) shift 2 ;;
    -H|-l) shift ;;
    *) src="$1"; shift ;;
  esac
done
case "$src" in
  *FAIL*) echo "cannot parse $src" >&2; exit 1 ;;
  *NOZMP*) exit 0 ;;
esac
base=$(basename "$src"); base=${base%.gz}; stem=${base%.*}
echo zonemap > "$out/$stem.zmp"
cp "$schema" "$out/$stem.schema"
"#;

        fn script() -> &'static Path {
            static DIR: OnceLock<(TempDir, PathBuf)> = OnceLock::new();
            &DIR.get_or_init(|| {
                let dir = TempDir::new().unwrap();
                let path = dir.path().join("fake-xrgdiv");
                fs::write(&path, SCRIPT).unwrap();
                fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
                (dir, path)
            })
            .1
        }

        fn setup() -> (TempDir, Converter, PathBuf) {
            let dir = TempDir::new().unwrap();
            let schema = dir.path().join("schema.json");
            fs::write(&schema, SCHEMA).unwrap();
            let conv = Converter::new(
                Tool::new(script()),
                vec![dir.path().join("d1"), dir.path().join("d2")],
                0,
            );
            (dir, conv, schema)
        }

        #[test]
        fn test_convert_then_check_schema() {
            let (dir, conv, schema) = setup();
            let source = dir.path().join("a.csv");
            fs::write(&source, "1,2.50\n").unwrap();
            let spec = FormatSpec::csv(CsvSpec::default());

            let zonemap = conv.convert("b", "x/a.csv", &source, &schema, &spec).unwrap();
            assert!(zonemap.is_absolute());
            assert_eq!(zonemap, dir.path().join("d1/b/x/a.zmp"));
            assert!(dir.path().join("d2/b/x").is_dir());
            assert!(check_schema(SCHEMA.as_bytes(), &zonemap, &spec).unwrap());
        }

        #[test]
        fn test_convert_failure_carries_stderr() {
            let (dir, conv, schema) = setup();
            let source = dir.path().join("FAIL.csv");
            fs::write(&source, "").unwrap();

            let err = conv
                .convert("b", "FAIL.csv", &source, &schema, &FormatSpec::csv(CsvSpec::default()))
                .unwrap_err();
            match err {
                ConvertError::ToolFailed { stderr, .. } => assert!(stderr.contains("cannot parse")),
                other => panic!("unexpected {:?}", other),
            }
        }

        #[test]
        fn test_convert_success_without_zonemap() {
            let (dir, conv, schema) = setup();
            let source = dir.path().join("NOZMP.csv");
            fs::write(&source, "").unwrap();

            let err = conv
                .convert("b", "NOZMP.csv", &source, &schema, &FormatSpec::csv(CsvSpec::default()))
                .unwrap_err();
            assert!(matches!(err, ConvertError::ArtifactMissing { .. }));
        }
    }
}
