//! Migration file discovery and parsing
//!
//! A migrations directory holds pairs of plain SQL files:
//!
//! ```text
//! 1_create_accounts.up.sql
//! 1_create_accounts.down.sql
//! 2_add_balance.up.sql
//! ```

use super::{Direction, MigrationError, Registry, SqlScript};
use regex::Regex;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

const FILE_NAME_PATTERN: &str = r"^(\d+)_([A-Za-z0-9_]+)\.(up|down)\.sql$";

/// A parsed migration file name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationFile {
    pub path: PathBuf,
    pub version: i64,
    pub name: String,
    pub direction: Direction,
}

impl MigrationFile {
    /// Parse `{version}_{name}.{up|down}.sql`
    ///
    /// # Example
    /// - `20240120120000_create_users.up.sql` → version 20240120120000, name "create_users", up
    pub fn parse_filename(filename: &str) -> Result<(i64, String, Direction), MigrationError> {
        let re = Regex::new(FILE_NAME_PATTERN)
            .map_err(|e| MigrationError::InvalidFormat(format!("invalid regex: {e}")))?;
        let caps = re.captures(filename).ok_or_else(|| {
            MigrationError::InvalidFormat(format!(
                "migration file name '{filename}' does not match {{version}}_{{name}}.{{up|down}}.sql"
            ))
        })?;

        let version = caps[1].parse::<i64>().map_err(|e| {
            MigrationError::InvalidFormat(format!("invalid version in '{filename}': {e}"))
        })?;
        // 0 is what an empty tracking table reads as
        if version == 0 {
            return Err(MigrationError::InvalidFormat(format!(
                "version in '{filename}' must be greater than 0"
            )));
        }
        let direction = match &caps[3] {
            "up" => Direction::Up,
            _ => Direction::Down,
        };

        Ok((version, caps[2].to_string(), direction))
    }
}

/// Scan `dir` for migration files, sorted by version then direction
///
/// Files without a `.sql` extension are ignored.
///
/// # Errors
///
/// - `FileNotFound` if the directory or an entry can't be read
/// - `InvalidFormat` for a `.sql` file whose name does not parse
pub fn discover_migrations(dir: &Path) -> Result<Vec<MigrationFile>, MigrationError> {
    if !dir.is_dir() {
        return Err(MigrationError::FileNotFound(dir.display().to_string()));
    }

    let entries = fs::read_dir(dir).map_err(|e| {
        MigrationError::FileNotFound(format!("failed to read {}: {e}", dir.display()))
    })?;

    let mut files = Vec::new();
    for entry in entries {
        let path = entry
            .map_err(|e| MigrationError::FileNotFound(format!("failed to read entry: {e}")))?
            .path();

        if !path.is_file() || path.extension().and_then(|s| s.to_str()) != Some("sql") {
            continue;
        }

        let filename = path.file_name().and_then(|n| n.to_str()).ok_or_else(|| {
            MigrationError::InvalidFormat(format!("invalid file name: {}", path.display()))
        })?;
        let (version, name, direction) = MigrationFile::parse_filename(filename)?;

        files.push(MigrationFile {
            path,
            version,
            name,
            direction,
        });
    }

    files.sort_by_key(|f| (f.version, f.direction == Direction::Down));
    Ok(files)
}

/// Build a SQL registry from the files in `dir`
///
/// Up and down files are paired by version. A version without a down file
/// gets an empty down script, so reverting it fails with `BlankScript`.
///
/// # Errors
///
/// Everything [`discover_migrations`] returns, plus `InvalidFormat` when one
/// version carries two different names or has no up file, and `FileNotFound`
/// when a file can't be read.
pub fn load_sql_registry(dir: impl AsRef<Path>) -> Result<Registry<SqlScript>, MigrationError> {
    let files = discover_migrations(dir.as_ref())?;

    let mut names: BTreeMap<i64, String> = BTreeMap::new();
    let mut ups: BTreeMap<i64, String> = BTreeMap::new();
    let mut downs: BTreeMap<i64, String> = BTreeMap::new();

    for file in files {
        if let Some(existing) = names.get(&file.version) {
            if *existing != file.name {
                return Err(MigrationError::InvalidFormat(format!(
                    "version {} has two names: '{existing}' and '{}'",
                    file.version, file.name
                )));
            }
        }

        let content = fs::read_to_string(&file.path).map_err(|e| {
            MigrationError::FileNotFound(format!("failed to read {}: {e}", file.path.display()))
        })?;

        names.insert(file.version, file.name);
        match file.direction {
            Direction::Up => ups.insert(file.version, content),
            Direction::Down => downs.insert(file.version, content),
        };
    }

    let mut scripts = BTreeMap::new();
    for version in names.into_keys() {
        let up = ups.remove(&version).ok_or_else(|| {
            MigrationError::InvalidFormat(format!("version {version} has no .up.sql file"))
        })?;
        let down = downs.remove(&version).unwrap_or_default();
        scripts.insert(version, SqlScript::new(version, up, down));
    }

    log::debug!(
        "loaded {} migrations from {}",
        scripts.len(),
        dir.as_ref().display()
    );
    Ok(Registry::from_map(scripts))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write(dir: &TempDir, name: &str, content: &str) {
        fs::write(dir.path().join(name), content).unwrap();
    }

    #[test]
    fn test_parse_filename() {
        let (version, name, direction) =
            MigrationFile::parse_filename("20240120120000_create_users.up.sql").unwrap();
        assert_eq!(version, 20240120120000);
        assert_eq!(name, "create_users");
        assert_eq!(direction, Direction::Up);

        let (_, _, direction) = MigrationFile::parse_filename("2_x.down.sql").unwrap();
        assert_eq!(direction, Direction::Down);
    }

    #[test]
    fn test_parse_filename_rejects_bad_names() {
        for bad in ["create.up.sql", "1_x.sql", "1_x.sideways.sql", "v1_x.up.sql", "1_.up.sql"] {
            assert!(
                matches!(
                    MigrationFile::parse_filename(bad),
                    Err(MigrationError::InvalidFormat(_))
                ),
                "{bad}"
            );
        }
    }

    #[test]
    fn test_version_zero_is_rejected() {
        let dir = TempDir::new().unwrap();
        write(&dir, "0_bootstrap.up.sql", "CREATE TABLE t(x int)");
        write(&dir, "1_add_y.up.sql", "ALTER TABLE t ADD y int");
        assert!(matches!(
            load_sql_registry(dir.path()),
            Err(MigrationError::InvalidFormat(msg)) if msg.contains("0_bootstrap")
        ));
    }

    #[test]
    fn test_load_pairs_up_and_down() {
        let dir = TempDir::new().unwrap();
        write(&dir, "2_add_y.up.sql", "ALTER TABLE t ADD y int");
        write(&dir, "2_add_y.down.sql", "ALTER TABLE t DROP COLUMN y");
        write(&dir, "1_create_t.up.sql", "CREATE TABLE t(x int)");
        write(&dir, "1_create_t.down.sql", "DROP TABLE t");
        write(&dir, "README.md", "ignored");

        let registry = load_sql_registry(dir.path()).unwrap();
        assert_eq!(registry.versions(), vec![1, 2]);
        let first = registry.get(1).unwrap();
        assert_eq!(first.up, "CREATE TABLE t(x int)");
        assert_eq!(first.down, "DROP TABLE t");
    }

    #[test]
    fn test_missing_down_is_blank() {
        let dir = TempDir::new().unwrap();
        write(&dir, "1_create_t.up.sql", "CREATE TABLE t(x int)");

        let registry = load_sql_registry(dir.path()).unwrap();
        assert!(registry.get(1).unwrap().down.is_empty());
    }

    #[test]
    fn test_missing_up_is_invalid() {
        let dir = TempDir::new().unwrap();
        write(&dir, "1_create_t.down.sql", "DROP TABLE t");
        assert!(matches!(
            load_sql_registry(dir.path()),
            Err(MigrationError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_conflicting_names_are_invalid() {
        let dir = TempDir::new().unwrap();
        write(&dir, "1_create_t.up.sql", "CREATE TABLE t(x int)");
        write(&dir, "1_create_u.down.sql", "DROP TABLE u");
        assert!(matches!(
            load_sql_registry(dir.path()),
            Err(MigrationError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_bad_sql_name_is_invalid() {
        let dir = TempDir::new().unwrap();
        write(&dir, "create_t.sql", "CREATE TABLE t(x int)");
        assert!(load_sql_registry(dir.path()).is_err());
    }

    #[test]
    fn test_missing_directory() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("nope");
        assert!(matches!(
            load_sql_registry(&missing),
            Err(MigrationError::FileNotFound(_))
        ));
    }

    #[test]
    fn test_empty_directory() {
        let dir = TempDir::new().unwrap();
        assert!(load_sql_registry(dir.path()).unwrap().is_empty());
    }
}
