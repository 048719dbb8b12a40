use std::fs::{self, File};
use std::io::{self, Write};
use std::path::Path;

use super::crypto::{ALPHA_NUM, pseudorandom_string};

/// Replace the contents of `path` so that readers see either the old or the
/// new document, never a mix of both.
///
/// The buffer goes to a sibling temp file which is synced and then renamed
/// over the destination. The parent directory is synced afterwards so the
/// rename itself survives a power loss. The temp file is removed if any
/// step fails.
pub fn write_atomic<P: AsRef<Path>, B: AsRef<[u8]>>(path: P, buf: B) -> io::Result<()> {
    let path = path.as_ref();
    let tmp_path = path.with_extension(format!("tmp-{}", pseudorandom_string(ALPHA_NUM, 6)));

    let res = File::create(&tmp_path)
        .and_then(|mut tmp| {
            tmp.write_all(buf.as_ref())?;
            tmp.sync_all()
        })
        .and_then(|_| fs::rename(&tmp_path, path));
    if let Err(err) = res {
        let _ = fs::remove_file(&tmp_path);
        return Err(err);
    }

    #[cfg(unix)]
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        File::open(parent)?.sync_all()?;
    }
    Ok(())
}
