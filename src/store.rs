//! A single-file container of named, typed, row-major arrays.
//!
//! Layout (all integers little-endian):
//!
//! ```text
//! "FSTR" | u32 version
//! field payloads, each contiguous, at the offset recorded in the directory
//! bincode(Directory) | u64 directory length | "FSTR"
//! ```
//!
//! Fields are sized up front and filled in with row-range writes, so a field can be
//! allocated for a worst-case row count and only partially written. The directory is
//! written by `StoreWriter::finish()`; a file without one was never finalized and
//! `StoreReader::open()` rejects it.

use std::fs::File;
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use log::debug;
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

use crate::error::{Error, IoResultExt, Result};

const MAGIC: &[u8; 4] = b"FSTR";
const FORMAT_VERSION: u32 = 1;
const HEADER_LEN: u64 = 8;
// u64 directory length + magic
const TRAILER_LEN: u64 = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DType
{
    F32,
    I32,
}

impl DType
{
    pub fn size(self) -> usize
    {
        match self
        {
            DType::F32 => 4,
            DType::I32 => 4,
        }
    }
}

/// Element types that can be stored in a field.
pub trait Element: Copy
{
    const DTYPE: DType;

    fn extend_le(&self, out: &mut Vec<u8>);
    fn from_le(bytes: [u8; 4]) -> Self;
}

impl Element for f32
{
    const DTYPE: DType = DType::F32;

    fn extend_le(&self, out: &mut Vec<u8>)
    {
        out.extend_from_slice(&self.to_le_bytes());
    }

    fn from_le(bytes: [u8; 4]) -> Self
    {
        f32::from_le_bytes(bytes)
    }
}

impl Element for i32
{
    const DTYPE: DType = DType::I32;

    fn extend_le(&self, out: &mut Vec<u8>)
    {
        out.extend_from_slice(&self.to_le_bytes());
    }

    fn from_le(bytes: [u8; 4]) -> Self
    {
        i32::from_le_bytes(bytes)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldInfo
{
    pub name: String,
    pub dtype: DType,
    pub shape: Vec<usize>,
    /// Byte offset of the first element from the start of the file.
    pub offset: u64,
}

impl FieldInfo
{
    pub fn rows(&self) -> usize
    {
        self.shape[0]
    }

    /// Number of elements in one row; 1 for a 1-D field.
    pub fn row_len(&self) -> usize
    {
        self.shape[1..].iter().product()
    }

    /// Payload size, or None when the shape does not fit in a `u64` byte count.
    pub fn byte_len(&self) -> Option<u64>
    {
        self.row_bytes()?.checked_mul(self.rows() as u64)
    }

    fn row_bytes(&self) -> Option<u64>
    {
        self.shape[1..].iter().try_fold(self.dtype.size() as u64, |acc, &dim| acc.checked_mul(dim as u64))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Directory
{
    fields: Vec<FieldInfo>,
}

/// Index of a field allocated by a `StoreWriter`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldId(usize);

pub struct StoreWriter
{
    path: PathBuf,
    file: File,
    fields: Vec<FieldInfo>,
    end: u64,
}

impl StoreWriter
{
    /// Creates the container, truncating any existing file at `path`.
    /// The parent directory must already exist.
    pub fn create(path: impl AsRef<Path>) -> Result<Self>
    {
        let path = path.as_ref().to_path_buf();
        let mut file = File::create(&path).at_path(&path)?;

        let mut header = Vec::with_capacity(HEADER_LEN as usize);
        header.extend_from_slice(MAGIC);
        header.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        file.write_all(&header).at_path(&path)?;

        Ok(StoreWriter { path, file, fields: Vec::new(), end: HEADER_LEN })
    }

    pub fn path(&self) -> &Path
    {
        &self.path
    }

    pub fn field(&self, id: FieldId) -> &FieldInfo
    {
        &self.fields[id.0]
    }

    /// Reserves space for a field. The payload reads back as zeroes until written.
    pub fn allocate(&mut self, name: &str, dtype: DType, shape: &[usize]) -> Result<FieldId>
    {
        if shape.is_empty() {
            return Err(Error::DataShape(format!("Field {:?} needs at least one dimension", name)));
        }
        if self.fields.iter().any(|f| f.name == name) {
            return Err(Error::DataShape(format!("Field {:?} is already allocated", name)));
        }

        let info = FieldInfo {
            name: name.to_string(),
            dtype,
            shape: shape.to_vec(),
            offset: self.end,
        };
        self.end = info.byte_len()
            .and_then(|len| self.end.checked_add(len))
            .ok_or_else(|| Error::DataShape(format!("Field {:?} with shape {:?} is too large", name, shape)))?;
        self.file.set_len(self.end).at_path(&self.path)?;
        debug!("Allocated field {:?} {:?} {:?} at offset {}", info.name, info.dtype, info.shape, info.offset);

        self.fields.push(info);
        Ok(FieldId(self.fields.len() - 1))
    }

    /// Writes whole rows starting at `start_row`. `data` must hold a multiple of the row length.
    pub fn write_rows<T: Element>(&mut self, id: FieldId, start_row: usize, data: &[T]) -> Result<()>
    {
        let info = &self.fields[id.0];
        if info.dtype != T::DTYPE {
            return Err(Error::DataShape(format!(
                "Field {:?} holds {:?}, got {:?}", info.name, info.dtype, T::DTYPE)));
        }

        let row_len = info.row_len();
        if row_len == 0 {
            return Ok(());
        }
        if data.len() % row_len != 0 {
            return Err(Error::DataShape(format!(
                "Field {:?} has rows of {} elements, got {} elements", info.name, row_len, data.len())));
        }
        let num_rows = data.len() / row_len;
        if start_row.checked_add(num_rows).map_or(true, |end| end > info.rows()) {
            return Err(Error::DataShape(format!(
                "Writing {} rows at row {} of field {:?} exceeds its {} rows",
                num_rows, start_row, info.name, info.rows())));
        }

        let offset = info.offset + (start_row * row_len * info.dtype.size()) as u64;
        let mut bytes = Vec::with_capacity(data.len() * info.dtype.size());
        for value in data {
            value.extend_le(&mut bytes);
        }

        self.file.seek(SeekFrom::Start(offset)).at_path(&self.path)?;
        self.file.write_all(&bytes).at_path(&self.path)?;
        Ok(())
    }

    /// Allocates a field and fills it in one go.
    pub fn write_array<T: Element>(&mut self, name: &str, shape: &[usize], data: &[T]) -> Result<FieldId>
    {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(Error::DataShape(format!(
                "Field {:?} with shape {:?} needs {} elements, got {}", name, shape, expected, data.len())));
        }
        let id = self.allocate(name, T::DTYPE, shape)?;
        self.write_rows(id, 0, data)?;
        Ok(id)
    }

    /// Writes the field directory and syncs the file to disk.
    pub fn finish(self) -> Result<()>
    {
        let StoreWriter { path, mut file, fields, end } = self;
        let directory = bincode::serialize(&Directory { fields })
            .map_err(|e| Error::Storage { path: path.clone(), source: io::Error::new(io::ErrorKind::InvalidData, e) })?;

        file.seek(SeekFrom::Start(end)).at_path(&path)?;
        let mut writer = BufWriter::new(&mut file);
        writer.write_all(&directory).at_path(&path)?;
        writer.write_all(&(directory.len() as u64).to_le_bytes()).at_path(&path)?;
        writer.write_all(MAGIC).at_path(&path)?;
        writer.flush().at_path(&path)?;
        drop(writer);

        file.sync_all().at_path(&path)?;
        Ok(())
    }
}

pub struct StoreReader
{
    path: PathBuf,
    file: File,
    fields: Vec<FieldInfo>,
}

impl StoreReader
{
    pub fn open(path: impl AsRef<Path>) -> Result<Self>
    {
        let path = path.as_ref().to_path_buf();
        let mut file = File::open(&path).at_path(&path)?;
        let file_len = file.metadata().at_path(&path)?.len();
        if file_len < HEADER_LEN + TRAILER_LEN {
            return Err(Error::CorruptStore(format!("{:?} is too short to be a feature store", path)));
        }

        let mut header = [0u8; HEADER_LEN as usize];
        file.read_exact(&mut header).at_path(&path)?;
        if &header[..4] != MAGIC {
            return Err(Error::CorruptStore(format!("{:?} is not a feature store", path)));
        }
        let version = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        if version != FORMAT_VERSION {
            return Err(Error::CorruptStore(format!("Unsupported format version {} in {:?}", version, path)));
        }

        let mut trailer = [0u8; TRAILER_LEN as usize];
        file.seek(SeekFrom::End(-(TRAILER_LEN as i64))).at_path(&path)?;
        file.read_exact(&mut trailer).at_path(&path)?;
        if &trailer[8..] != MAGIC {
            return Err(Error::CorruptStore(format!("{:?} was not finalized", path)));
        }
        let mut len_bytes = [0u8; 8];
        len_bytes.copy_from_slice(&trailer[..8]);
        let directory_len = u64::from_le_bytes(len_bytes);
        let directory_start = file_len
            .checked_sub(TRAILER_LEN + directory_len)
            .filter(|start| *start >= HEADER_LEN)
            .ok_or_else(|| Error::CorruptStore(format!("Bad directory length in {:?}", path)))?;

        let mut directory = vec![0u8; directory_len as usize];
        file.seek(SeekFrom::Start(directory_start)).at_path(&path)?;
        file.read_exact(&mut directory).at_path(&path)?;
        let directory: Directory = bincode::deserialize(&directory)
            .map_err(|e| Error::CorruptStore(format!("Unreadable directory in {:?}: {}", path, e)))?;

        for field in directory.fields.iter() {
            let end = if field.shape.is_empty() {
                None
            } else {
                field.byte_len().and_then(|len| field.offset.checked_add(len))
            };
            if end.map_or(true, |end| field.offset < HEADER_LEN || end > directory_start) {
                return Err(Error::CorruptStore(format!("Field {:?} lies outside the payload of {:?}", field.name, path)));
            }
        }

        Ok(StoreReader { path, file, fields: directory.fields })
    }

    pub fn fields(&self) -> &[FieldInfo]
    {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldInfo>
    {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Reads the first `rows` rows of a field as a flat vector.
    fn read_rows<T: Element>(&mut self, name: &str, rows: usize) -> Result<(FieldInfo, Vec<T>)>
    {
        let info = self.field(name)
            .cloned()
            .ok_or_else(|| Error::CorruptStore(format!("Missing field {:?} in {:?}", name, self.path)))?;
        if info.dtype != T::DTYPE {
            return Err(Error::CorruptStore(format!("Field {:?} holds {:?}, expected {:?}", name, info.dtype, T::DTYPE)));
        }
        if rows > info.rows() {
            return Err(Error::CorruptStore(format!("Field {:?} has {} rows, asked for {}", name, info.rows(), rows)));
        }

        let mut bytes = vec![0u8; rows * info.row_len() * info.dtype.size()];
        self.file.seek(SeekFrom::Start(info.offset)).at_path(&self.path)?;
        self.file.read_exact(&mut bytes).at_path(&self.path)?;

        let values = bytes
            .chunks_exact(4)
            .map(|c| T::from_le([c[0], c[1], c[2], c[3]]))
            .collect();
        Ok((info, values))
    }

    pub fn read_f32_2d(&mut self, name: &str) -> Result<Array2<f32>>
    {
        let rows = self.rows_of(name)?;
        self.read_f32_rows(name, rows)
    }

    /// Reads the leading `rows` rows of a 2-D `f32` field.
    pub fn read_f32_rows(&mut self, name: &str, rows: usize) -> Result<Array2<f32>>
    {
        let (info, values) = self.read_rows::<f32>(name, rows)?;
        if info.shape.len() != 2 {
            return Err(Error::CorruptStore(format!("Field {:?} has shape {:?}, expected 2-D", name, info.shape)));
        }
        Array2::from_shape_vec((rows, info.shape[1]), values)
            .map_err(|e| Error::CorruptStore(e.to_string()))
    }

    pub fn read_i32_1d(&mut self, name: &str) -> Result<Array1<i32>>
    {
        let rows = self.rows_of(name)?;
        self.read_i32_prefix(name, rows)
    }

    /// Reads the leading `len` entries of a 1-D `i32` field.
    pub fn read_i32_prefix(&mut self, name: &str, len: usize) -> Result<Array1<i32>>
    {
        let (info, values) = self.read_rows::<i32>(name, len)?;
        if info.shape.len() != 1 {
            return Err(Error::CorruptStore(format!("Field {:?} has shape {:?}, expected 1-D", name, info.shape)));
        }
        Ok(Array1::from_vec(values))
    }

    fn rows_of(&self, name: &str) -> Result<usize>
    {
        self.field(name)
            .map(|f| f.rows())
            .ok_or_else(|| Error::CorruptStore(format!("Missing field {:?} in {:?}", name, self.path)))
    }
}
