//! Crop grids for composite models.
//!
//! A composite descriptor splits one source image into a grid of cells. Each
//! group describes a row-major grid: `start` is the top-left corner of the
//! first cell, `size` the cell size, `count` the number of columns and rows,
//! and `gap` the spacing between neighbouring cells.
//!
//! Validated grids hold at most [`MAX_CROP_CELLS`] cells and lie entirely
//! within `u32` pixel coordinates.

use crate::descriptor::ImageSize;
use crate::preprocess::PreprocessError;
use image::{DynamicImage, ImageFormat};
use serde::{Deserialize, Serialize};
use std::io::Cursor;

pub const MAX_CROP_CELLS: u64 = 1024;

/// One rectangular grid of crop cells, `[x, y]` ordered pairs throughout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CropGrid {
    pub start: [u32; 2],
    pub size: [u32; 2],
    pub count: [u32; 2],
    #[serde(default)]
    pub gap: [u32; 2],
}

/// A cell rectangle inside the source image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CellRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl CellRect {
    /// Integer centre point `[x, y]`.
    pub fn center(&self) -> [u32; 2] {
        [self.x + self.width / 2, self.y + self.height / 2]
    }

    pub fn size(&self) -> ImageSize {
        ImageSize::new(self.width, self.height)
    }

    fn right(&self) -> u32 {
        self.x.saturating_add(self.width)
    }

    fn bottom(&self) -> u32 {
        self.y.saturating_add(self.height)
    }
}

impl CropGrid {
    /// Cells in row-major order: rows outer, columns inner.
    pub fn cells(&self) -> Vec<CellRect> {
        let [cols, rows] = self.count;
        let mut cells = Vec::with_capacity(self.len());
        for row in 0..rows {
            for col in 0..cols {
                cells.push(CellRect {
                    x: self.start[0] + col * (self.size[0] + self.gap[0]),
                    y: self.start[1] + row * (self.size[1] + self.gap[1]),
                    width: self.size[0],
                    height: self.size[1],
                });
            }
        }
        cells
    }

    pub fn len(&self) -> usize {
        self.count[0] as usize * self.count[1] as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.size[0] == 0 || self.size[1] == 0 {
            return Err("crop cell size must be positive".to_string());
        }
        if self.count[0] == 0 || self.count[1] == 0 {
            return Err("crop cell count must be positive".to_string());
        }
        let cells = self.count[0] as u64 * self.count[1] as u64;
        if cells > MAX_CROP_CELLS {
            return Err(format!(
                "crop grid has {} cells, at most {} allowed",
                cells, MAX_CROP_CELLS
            ));
        }
        for axis in 0..2 {
            self.extent(axis).ok_or_else(|| {
                format!("crop grid exceeds the pixel range along axis {}", axis)
            })?;
        }
        Ok(())
    }

    /// Far edge of the last cell along `axis`, `None` on overflow.
    fn extent(&self, axis: usize) -> Option<u32> {
        let step = self.size[axis].checked_add(self.gap[axis])?;
        (self.count[axis] - 1)
            .checked_mul(step)?
            .checked_add(self.start[axis])?
            .checked_add(self.size[axis])
    }
}

/// Crop parameters of a composite descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CropSpec {
    /// Emit `[x, y]` centre points of matching cells instead of labels.
    #[serde(default)]
    pub coordinates: bool,
    /// Flat cell indices holding the titles to match against.
    #[serde(default = "default_title_index")]
    pub title_index: Vec<usize>,
    pub groups: Vec<CropGrid>,
}

fn default_title_index() -> Vec<usize> {
    vec![0]
}

impl CropSpec {
    /// Cells of every group, one vector per group.
    pub fn group_cells(&self) -> Vec<Vec<CellRect>> {
        self.groups.iter().map(CropGrid::cells).collect()
    }

    pub fn total_cells(&self) -> usize {
        self.groups.iter().map(CropGrid::len).sum()
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.groups.is_empty() {
            return Err("crop requires at least one group".to_string());
        }
        for group in &self.groups {
            group.validate()?;
        }
        let total = self.total_cells();
        if let Some(bad) = self.title_index.iter().find(|i| **i >= total) {
            return Err(format!(
                "title index {} out of range for {} crop cells",
                bad, total
            ));
        }
        Ok(())
    }
}

/// Cut `rects` out of an encoded image and re-encode each cell as PNG.
pub fn crop_cells(image: &[u8], rects: &[CellRect]) -> Result<Vec<Vec<u8>>, PreprocessError> {
    let source =
        image::load_from_memory(image).map_err(|e| PreprocessError::ImageDamage(e.to_string()))?;
    let bounds = ImageSize::new(source.width(), source.height());

    let mut cells = Vec::with_capacity(rects.len());
    for rect in rects {
        if rect.right() > bounds.width || rect.bottom() > bounds.height {
            return Err(PreprocessError::ImageSizeMismatch {
                expected: format!("at least {}x{}", rect.right(), rect.bottom()),
                actual: bounds.to_string(),
            });
        }
        let cell = source.crop_imm(rect.x, rect.y, rect.width, rect.height);
        cells.push(encode_png(&cell)?);
    }
    Ok(cells)
}

pub(crate) fn encode_png(image: &DynamicImage) -> Result<Vec<u8>, PreprocessError> {
    let mut buf = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .map_err(|e| PreprocessError::ImageDamage(e.to_string()))?;
    Ok(buf)
}

/// Centre points of candidate cells whose label equals one of the titles.
///
/// Titles are visited in order; for each title every matching candidate
/// contributes its centre, so the output order follows the titles.
pub fn match_coordinates(titles: &[String], candidates: &[(String, CellRect)]) -> Vec<[u32; 2]> {
    let mut points = Vec::new();
    for title in titles {
        for (label, rect) in candidates {
            if label == title {
                points.push(rect.center());
            }
        }
    }
    points
}
