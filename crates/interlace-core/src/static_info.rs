//! Static program information: images and instructions.
//!
//! The instrumentation substrate reports program points as (image, offset)
//! pairs. `StaticInfo` interns both so the rest of the engine can compare
//! plain integer ids. Databases persist instruction ids and resolve them
//! back through this table at load time.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::types::Address;

pub type ImageId = u32;
pub type InstId = u32;

/// Classification used by the controllers' ignore filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImageKind {
    /// The program binary itself.
    Main,
    /// A pthread implementation library.
    Pthread,
    /// A common system library (libc, libm, ...).
    CommonLib,
    /// Anything else.
    Other,
}

/// A loaded binary image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Image {
    pub id: ImageId,
    pub name: String,
    pub kind: ImageKind,
}

impl Image {
    pub fn is_pthread(&self) -> bool {
        self.kind == ImageKind::Pthread
    }

    pub fn is_common_lib(&self) -> bool {
        self.kind == ImageKind::CommonLib
    }
}

/// A program point: an offset within an image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Inst {
    pub id: InstId,
    pub image_id: ImageId,
    pub offset: Address,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StaticInfoTables {
    images: Vec<Image>,
    insts: Vec<Inst>,
    #[serde(skip)]
    image_index: HashMap<String, ImageId>,
    #[serde(skip)]
    inst_index: HashMap<(ImageId, Address), InstId>,
}

impl StaticInfoTables {
    fn rebuild_indexes(&mut self) {
        self.image_index = self
            .images
            .iter()
            .map(|img| (img.name.clone(), img.id))
            .collect();
        self.inst_index = self
            .insts
            .iter()
            .map(|inst| ((inst.image_id, inst.offset), inst.id))
            .collect();
    }
}

/// Interning table for images and instructions.
#[derive(Debug, Default)]
pub struct StaticInfo {
    tables: Mutex<StaticInfoTables>,
}

impl StaticInfo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern an image by name.
    pub fn get_image(&self, name: &str, kind: ImageKind) -> ImageId {
        let mut t = self.tables.lock().unwrap();
        if let Some(&id) = t.image_index.get(name) {
            return id;
        }
        let id = t.images.len() as ImageId;
        t.images.push(Image {
            id,
            name: name.to_string(),
            kind,
        });
        t.image_index.insert(name.to_string(), id);
        id
    }

    /// Intern an instruction by (image, offset).
    pub fn get_inst(&self, image_id: ImageId, offset: Address) -> InstId {
        let mut t = self.tables.lock().unwrap();
        if let Some(&id) = t.inst_index.get(&(image_id, offset)) {
            return id;
        }
        let id = t.insts.len() as InstId;
        t.insts.push(Inst {
            id,
            image_id,
            offset,
        });
        t.inst_index.insert((image_id, offset), id);
        id
    }

    pub fn find_inst(&self, id: InstId) -> Option<Inst> {
        self.tables.lock().unwrap().insts.get(id as usize).cloned()
    }

    pub fn find_image(&self, id: ImageId) -> Option<Image> {
        self.tables.lock().unwrap().images.get(id as usize).cloned()
    }

    /// Image classification for an instruction, for the ignore filters.
    pub fn inst_image_kind(&self, id: InstId) -> Option<ImageKind> {
        let t = self.tables.lock().unwrap();
        let inst = t.insts.get(id as usize)?;
        t.images.get(inst.image_id as usize).map(|img| img.kind)
    }

    pub fn inst_count(&self) -> usize {
        self.tables.lock().unwrap().insts.len()
    }

    pub fn save(&self, path: &Path) -> io::Result<()> {
        let t = self.tables.lock().unwrap();
        let text = serde_json::to_string_pretty(&*t).map_err(io::Error::other)?;
        fs::write(path, text)
    }

    pub fn load(&self, path: &Path) -> io::Result<()> {
        let text = fs::read_to_string(path)?;
        let mut loaded: StaticInfoTables = serde_json::from_str(&text).map_err(io::Error::other)?;
        loaded.rebuild_indexes();
        *self.tables.lock().unwrap() = loaded;
        Ok(())
    }
}
