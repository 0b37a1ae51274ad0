//! Binary checkpoint files and discovery of the newest one in a directory.
//!
//! Layout; integers are little endian, tensor data is `f32` in native byte order:
//!
//! ```text
//! b"UNMK" | version u32 | header_len u32 | header (ByteNetArgs as json)
//! count u32 | count x (name_len u32 | name | rank u32 | rank x dim u32 | data)
//! ```

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use bytemuck::{cast_slice, cast_slice_mut};
use memmap2::MmapOptions;
use ndarray::{ArrayD, IxDyn};
use unmask::{ByteNetArgs, ByteNetLM};

use crate::error::{Result, StoreError};

const MAGIC: &[u8; 4] = b"UNMK";
const VERSION: u32 = 1;

/// Model arguments plus every named parameter tensor.
#[derive(Clone, Debug)]
pub struct Checkpoint {
    pub args: ByteNetArgs,
    pub tensors: HashMap<String, ArrayD<f32>>,
}

impl Checkpoint {
    pub fn from_model(model: &ByteNetLM) -> Self {
        let mut tensors = HashMap::new();
        model.visit_parameters(&mut |name, view| {
            tensors.insert(name, view.to_owned());
        });
        Self {
            args: model.args.clone(),
            tensors,
        }
    }

    /// Copy the stored parameters into `model`.
    pub fn restore(&self, model: &mut ByteNetLM) -> Result<()> {
        if self.args != model.args {
            log::warn!(
                "checkpoint was saved with {:?}, restoring into {:?}",
                self.args,
                model.args
            );
        }
        model.load_parameters(&self.tensors)?;
        Ok(())
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_all(MAGIC)?;
        w.write_all(&VERSION.to_le_bytes())?;
        let header = serde_json::to_vec(&self.args)?;
        w.write_all(&(header.len() as u32).to_le_bytes())?;
        w.write_all(&header)?;

        let mut names: Vec<&String> = self.tensors.keys().collect();
        names.sort();
        w.write_all(&(names.len() as u32).to_le_bytes())?;
        for name in names {
            let tensor = &self.tensors[name];
            w.write_all(&(name.len() as u32).to_le_bytes())?;
            w.write_all(name.as_bytes())?;
            w.write_all(&(tensor.ndim() as u32).to_le_bytes())?;
            for &dim in tensor.shape() {
                w.write_all(&(dim as u32).to_le_bytes())?;
            }
            let data: Vec<f32> = tensor.iter().copied().collect();
            w.write_all(cast_slice(&data))?;
        }
        Ok(())
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(buf);
        if reader.take(MAGIC.len(), "magic")? != MAGIC {
            return Err(StoreError::BadMagic);
        }
        let version = reader.u32("version")?;
        if version != VERSION {
            return Err(StoreError::UnsupportedVersion(version));
        }
        let header_len = reader.u32("header length")? as usize;
        let args: ByteNetArgs = serde_json::from_slice(reader.take(header_len, "header")?)?;

        let count = reader.u32("tensor count")?;
        let mut tensors = HashMap::new();
        for _ in 0..count {
            let name_len = reader.u32("name length")? as usize;
            let name = String::from_utf8(reader.take(name_len, "name")?.to_vec()).map_err(|err| {
                StoreError::Malformed {
                    name: "<name>".into(),
                    reason: err.to_string(),
                }
            })?;
            let rank = reader.u32("rank")? as usize;
            let mut dims = Vec::new();
            for _ in 0..rank {
                dims.push(reader.u32("dims")? as usize);
            }
            let numel = dims
                .iter()
                .try_fold(1usize, |acc, &d| acc.checked_mul(d))
                .filter(|n| n.checked_mul(std::mem::size_of::<f32>()).is_some())
                .ok_or_else(|| StoreError::Malformed {
                    name: name.clone(),
                    reason: format!("shape {dims:?} overflows"),
                })?;
            let bytes = reader.take(numel * std::mem::size_of::<f32>(), "tensor data")?;
            let mut data = vec![0f32; numel];
            cast_slice_mut::<f32, u8>(&mut data).copy_from_slice(bytes);
            let tensor = ArrayD::from_shape_vec(IxDyn(&dims), data).map_err(|err| StoreError::Malformed {
                name: name.clone(),
                reason: err.to_string(),
            })?;
            tensors.insert(name, tensor);
        }
        Ok(Self { args, tensors })
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut f = BufWriter::new(File::create(path)?);
        self.write_to(&mut f)?;
        f.flush()?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let bytes = fs::read(path)?;
        Self::from_bytes(&bytes)
    }

    pub fn load_mmap<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        // SAFETY: the mapping is read once into owned tensors before it is dropped.
        let mmap = unsafe { MmapOptions::new().map(&file)? };
        Self::from_bytes(&mmap[..])
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, offset: 0 }
    }

    fn take(&mut self, n: usize, what: &'static str) -> Result<&'a [u8]> {
        let end = self
            .offset
            .checked_add(n)
            .filter(|&end| end <= self.buf.len())
            .ok_or(StoreError::Truncated(what))?;
        let out = &self.buf[self.offset..end];
        self.offset = end;
        Ok(out)
    }

    fn u32(&mut self, what: &'static str) -> Result<u32> {
        let bytes = self.take(4, what)?;
        let bytes: [u8; 4] = bytes.try_into().map_err(|_| StoreError::Truncated(what))?;
        Ok(u32::from_le_bytes(bytes))
    }
}

/// Epoch number embedded in a checkpoint file name, e.g. `checkpoint12.bin`.
pub fn checkpoint_epoch(file_name: &str) -> Option<u64> {
    let (_, rest) = file_name.rsplit_once("checkpoint")?;
    rest.split('.').next()?.parse().ok()
}

/// File name used for the checkpoint of `epoch`.
pub fn checkpoint_file_name(epoch: u64) -> String {
    format!("checkpoint{epoch}.bin")
}

/// Newest checkpoint in `dir` by embedded epoch number.
pub fn latest_checkpoint<P: AsRef<Path>>(dir: P) -> Result<Option<(u64, PathBuf)>> {
    let mut latest: Option<(u64, PathBuf)> = None;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if !name.contains("checkpoint") {
            continue;
        }
        match checkpoint_epoch(name) {
            Some(epoch) if latest.as_ref().map_or(true, |(best, _)| epoch > *best) => {
                latest = Some((epoch, entry.path()));
            }
            Some(_) => {}
            None => log::warn!("skipping {name}: no epoch number"),
        }
    }
    Ok(latest)
}
