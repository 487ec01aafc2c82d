//! Preset and catalogue discovery on disk.
//!
//! Presets are `*.json` documents or `*.lua` scripts that return a table with
//! the same shape. Lua scripts run in a fresh VM with a small `F` table
//! (`F.log`) and are converted through mlua's serde bridge.

use std::fs;
use std::path::{Path, PathBuf};

use mlua::{Lua, LuaSerdeExt, Table, Value};

use crate::catalogue::Catalogue;
use crate::error::LoadError;
use crate::logger;
use crate::preset::PresetDoc;

/// A preset found on disk, loaded or not.
#[derive(Debug)]
pub struct PresetEntry {
    /// Path relative to the presets root, without extension.
    pub name: String,
    pub path: PathBuf,
    pub doc: Result<PresetDoc, LoadError>,
}

impl PresetEntry {
    pub fn id(&self) -> Option<&str> {
        self.doc.as_ref().ok().map(|d| d.id.as_str())
    }
}

fn is_preset_file(path: &Path) -> bool {
    matches!(path.extension().and_then(|e| e.to_str()), Some("json") | Some("lua"))
}

/// Recursively find preset files under `dir`, sorted by path. Hidden
/// directories and `node_modules` are skipped.
pub fn find_preset_files(dir: &Path) -> Vec<PathBuf> {
    let mut results = Vec::new();
    let entries = match fs::read_dir(dir) {
        Ok(e) => e,
        Err(_) => return results,
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let name = path.file_name().unwrap_or_default().to_string_lossy().to_string();
        if name.starts_with('.') {
            continue;
        }
        if path.is_dir() {
            if name != "node_modules" {
                results.extend(find_preset_files(&path));
            }
        } else if is_preset_file(&path) {
            results.push(path);
        }
    }
    results.sort();
    results
}

/// `presets/wow/fire.lua` under root `presets` -> `wow/fire`
pub fn derive_preset_name(path: &Path, root: &Path) -> String {
    let rel = path.strip_prefix(root).unwrap_or(path);
    rel.with_extension("").to_string_lossy().replace('\\', "/")
}

fn read(path: &Path) -> Result<String, LoadError> {
    fs::read_to_string(path).map_err(|source| LoadError::Io { path: path.to_path_buf(), source })
}

fn lua_error(path: &Path, e: mlua::Error) -> LoadError {
    LoadError::Lua { path: path.to_path_buf(), message: e.to_string() }
}

/// Register the `F.*` table into a Lua state.
fn register_globals(lua: &Lua, tag: &str) -> mlua::Result<()> {
    let f_table = lua.create_table()?;

    // F.log(msg), tagged with the script name
    let tag = tag.to_string();
    let log_fn = lua.create_function(move |_, msg: String| {
        tracing::info!(target: "lua", preset = %tag, "{}", msg);
        Ok(())
    })?;
    f_table.set("log", log_fn)?;

    lua.globals().set("F", f_table)?;
    Ok(())
}

fn load_lua(path: &Path, tag: &str) -> Result<PresetDoc, LoadError> {
    let code = read(path)?;
    let lua = Lua::new();
    register_globals(&lua, tag).map_err(|e| lua_error(path, e))?;

    // let `require` find helpers next to the script
    if let Some(dir) = path.parent() {
        let dir = dir.to_string_lossy();
        let pkg: Table = lua.globals().get("package").map_err(|e| lua_error(path, e))?;
        pkg.set("path", format!("{}/?.lua;{}/?/init.lua", dir, dir))
            .map_err(|e| lua_error(path, e))?;
    }

    let value: Value = lua
        .load(&code)
        .set_name(path.to_string_lossy())
        .eval()
        .map_err(|e| lua_error(path, e))?;
    if !value.is_table() {
        return Err(LoadError::Lua {
            path: path.to_path_buf(),
            message: format!("script must return a table, got {}", value.type_name()),
        });
    }
    lua.from_value(value).map_err(|e| lua_error(path, e))
}

/// Load one preset document. The file extension selects the format.
pub fn load_preset(path: &Path) -> Result<PresetDoc, LoadError> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => {
            let text = read(path)?;
            serde_json::from_str(&text).map_err(|source| LoadError::Json { path: path.to_path_buf(), source })
        }
        Some("lua") => {
            let tag = path.file_stem().unwrap_or_default().to_string_lossy().to_string();
            load_lua(path, &tag)
        }
        _ => Err(LoadError::Unsupported { path: path.to_path_buf() }),
    }
}

/// Load every preset under `dir`. Broken files are kept with their error so
/// the host can show them.
pub fn load_presets(dir: &Path) -> Vec<PresetEntry> {
    logger::register_prefix("lua", logger::COLOR_BLUE);
    find_preset_files(dir)
        .into_iter()
        .map(|path| {
            let name = derive_preset_name(&path, dir);
            let doc = load_preset(&path);
            if let Err(e) = &doc {
                tracing::error!("failed to load preset {}: {}", name, e);
            }
            PresetEntry { name, path, doc }
        })
        .collect()
}

/// Load the skill/point catalogue. A missing file is an empty catalogue.
pub fn load_catalogue(path: &Path) -> Result<Catalogue, LoadError> {
    if !path.exists() {
        tracing::warn!("catalogue {} not found, starting empty", path.display());
        return Ok(Catalogue::new());
    }
    let text = read(path)?;
    serde_json::from_str(&text).map_err(|source| LoadError::Json { path: path.to_path_buf(), source })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preset::NodeDoc;
    use std::fs;

    fn write(dir: &Path, rel: &str, body: &str) -> PathBuf {
        let p = dir.join(rel);
        fs::create_dir_all(p.parent().unwrap()).unwrap();
        fs::write(&p, body).unwrap();
        p
    }

    const JSON_PRESET: &str = r#"{
        "id": "fire",
        "global_tracks": [{ "id": "g", "nodes": [
            { "kind": "skill", "id": "n1", "skill_id": "fb" }
        ]}]
    }"#;

    const LUA_PRESET: &str = r#"
        F.log("building")
        local nodes = {}
        for i, s in ipairs({ "fb", "pyro" }) do
            nodes[i] = { kind = "skill", id = "n" .. i, skill_id = s, gap_ms = 100 * i }
        end
        return {
            id = "lua-rot",
            name = "Lua rotation",
            global_tracks = { { id = "g", nodes = nodes } },
        }
    "#;

    #[test]
    fn discovers_nested_presets_and_skips_hidden() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.json", JSON_PRESET);
        write(dir.path(), "wow/fire.lua", LUA_PRESET);
        write(dir.path(), ".git/x.json", "{}");
        write(dir.path(), "notes.txt", "hi");

        let files = find_preset_files(dir.path());
        let names: Vec<String> = files.iter().map(|p| derive_preset_name(p, dir.path())).collect();
        assert_eq!(names, vec!["a", "wow/fire"]);
    }

    #[test]
    fn lua_preset_converts_through_serde() {
        let dir = tempfile::tempdir().unwrap();
        let p = write(dir.path(), "rot.lua", LUA_PRESET);
        let doc = load_preset(&p).unwrap();
        assert_eq!(doc.id, "lua-rot");
        assert_eq!(doc.global_tracks[0].nodes.len(), 2);
        match &doc.global_tracks[0].nodes[1] {
            NodeDoc::Skill(s) => {
                assert_eq!(s.skill_id, "pyro");
                assert_eq!(s.gap_ms, Some(200));
            }
            other => panic!("unexpected node {:?}", other),
        }
    }

    #[test]
    fn broken_files_report_their_path() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "bad.json", "{ nope");
        write(dir.path(), "bad.lua", "return 42");
        write(dir.path(), "ok.json", JSON_PRESET);

        let entries = load_presets(dir.path());
        assert_eq!(entries.len(), 3);
        assert!(matches!(entries[0].doc, Err(LoadError::Json { .. })));
        assert!(matches!(&entries[1].doc, Err(LoadError::Lua { message, .. }) if message.contains("table")));
        assert_eq!(entries[2].id(), Some("fire"));
    }

    #[test]
    fn missing_catalogue_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let cat = load_catalogue(&dir.path().join("none.json")).unwrap();
        assert_eq!(cat.skills().count(), 0);

        let p = write(
            dir.path(),
            "catalogue.json",
            r#"{ "skills": [{ "id": "fb", "key": "1", "cast_ms": 1500 }], "points": [] }"#,
        );
        let cat = load_catalogue(&p).unwrap();
        assert_eq!(cat.skill("fb").map(|s| s.cast_ms), Some(1500));
    }
}
