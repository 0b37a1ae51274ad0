//! Config loading and checkpoint storage around the `unmask` generator.

use std::path::Path;

use rand::Rng;
use unmask::{ByteNetArgs, ByteNetLM};

pub mod checkpoint;
pub mod config;
pub mod error;

pub use checkpoint::{checkpoint_epoch, checkpoint_file_name, latest_checkpoint, Checkpoint};
pub use config::RunConfig;
pub use error::{Result, StoreError};

/// Save a randomly initialized model for `args` to `path`.
pub fn init_checkpoint<R: Rng + ?Sized>(args: ByteNetArgs, path: &Path, rng: &mut R) -> Result<()> {
    let model = ByteNetLM::new(args, rng)?;
    Checkpoint::from_model(&model).save(path)
}

/// Build a model for `args` and restore the newest checkpoint found in `dir`.
///
/// Returns the epoch of the restored checkpoint.
pub fn restore_latest(args: ByteNetArgs, dir: &Path) -> Result<(u64, ByteNetLM)> {
    let (epoch, path) = latest_checkpoint(dir)?.ok_or_else(|| StoreError::NoCheckpoint(dir.to_path_buf()))?;
    log::info!("loading weights from {}...", path.display());

    let checkpoint = Checkpoint::load_mmap(&path).or_else(|err| {
        log::warn!("mmap load failed ({err}), reading {} instead", path.display());
        Checkpoint::load(&path)
    })?;
    let mut model = ByteNetLM::new(args, &mut rand::thread_rng())?;
    checkpoint.restore(&mut model)?;
    Ok((epoch, model))
}
