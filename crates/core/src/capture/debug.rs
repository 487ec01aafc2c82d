use std::path::{Path, PathBuf};

use image::{Rgba, RgbaImage};

use super::Snapshot;

/// Write each frame of `snap` as `<dir>/snap-v<version>-m<monitor>.png`.
pub fn dump_snapshot(snap: &Snapshot, dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    std::fs::create_dir_all(dir)?;
    let mut written = Vec::new();
    for (monitor, frame) in &snap.frames {
        let mut img = RgbaImage::new(frame.width, frame.height);
        for (x, y, px) in img.enumerate_pixels_mut() {
            let idx = (y * frame.bytes_per_row + x * 4) as usize;
            if let Some(bgra) = frame.data.get(idx..idx + 4) {
                *px = Rgba([bgra[2], bgra[1], bgra[0], 0xff]);
            }
        }
        let path = dir.join(format!("snap-v{}-m{}.png", snap.plan_version, monitor));
        img.save(&path)?;
        written.push(path);
    }
    Ok(written)
}
