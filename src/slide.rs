//! Slide handles.
//!
//! A [`Slide`] is one opened container: the immutable pyramid geometry and
//! codeblock directory produced by the header parser, the positional block
//! source, the codeblock decoder, and the mutable per-tile coefficient
//! state that the shared cache manages. Closing a slide is dropping it.

use std::path::Path;
use std::sync::OnceLock;

use bytes::Bytes;

use crate::cache::{CacheBinding, SharedTileTable, SlideCache};
use crate::decoder::{decode_jpeg_rgb, CoeffDecoder};
use crate::error::{IsyntaxError, IsyntaxResult};
use crate::format::{CodeblockEntry, DataChunk, EmbeddedImage, SlideLayout, SlideProperties};
use crate::idwt::{IdwtKernel, LiftingIdwt};
use crate::io::{BlockSource, FileSource};
use crate::reconstruct::{read_tile_impl, PixelFormat};
use crate::region::read_region_impl;
use crate::tile::{Level, Pyramid, TileTable};

/// How much of the container to parse at open time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenFlags {
    /// Parse everything needed to serve tile and region reads.
    Full,
    /// Stop parsing as soon as the barcode attribute is known. Intended
    /// for bulk directory walks; the resulting slide has no pyramid and
    /// tile reads fail with `NotFound`.
    BarcodeOnly,
}

/// External container front-end: parses the header metadata tree and
/// seek-table into a [`SlideLayout`] and supplies the matching codeblock
/// decoder and synthesis kernel.
pub trait ContainerFormat: Send + Sync {
    fn parse(&self, source: &dyn BlockSource, flags: OpenFlags) -> IsyntaxResult<SlideLayout>;

    fn coefficient_decoder(&self) -> Box<dyn CoeffDecoder>;

    /// The per-channel synthesis primitive matching this container's
    /// wavelet family. Defaults to the in-crate 5/3 lifting kernel.
    fn idwt_kernel(&self) -> Box<dyn IdwtKernel> {
        Box::new(LiftingIdwt)
    }
}

/// Neutral mid-grey low-pass coefficient used where LL data is missing.
const DUMMY_LL_VALUE: i16 = 128;

/// One opened slide container.
pub struct Slide {
    source: Box<dyn BlockSource>,
    codec: Box<dyn CoeffDecoder>,
    idwt: Box<dyn IdwtKernel>,
    pyramid: Pyramid,
    tiles: SharedTileTable,
    codeblocks: Vec<CodeblockEntry>,
    data_chunks: Vec<DataChunk>,
    properties: SlideProperties,
    label_image: Option<EmbeddedImage>,
    macro_image: Option<EmbeddedImage>,
    compressor_version: i32,
    data_model_major_version: i32,
    /// Shared read-only stand-in planes for missing neighbor data. The
    /// synthesis gather copies from them and never writes through them.
    ll_dummy: Box<[i16]>,
    h_dummy: Box<[i16]>,
    binding: OnceLock<CacheBinding>,
}

impl Slide {
    /// Open a container from disk through an external format front-end.
    pub fn open(
        path: &Path,
        flags: OpenFlags,
        format: &dyn ContainerFormat,
    ) -> IsyntaxResult<Self> {
        let source = FileSource::open(path)?;
        let layout = format.parse(&source, flags)?;
        Ok(
            Self::from_parts(Box::new(source), format.coefficient_decoder(), layout)?
                .with_idwt_kernel(format.idwt_kernel()),
        )
    }

    /// Assemble a slide from already-parsed parts. This is the seam used
    /// by in-memory containers and tests.
    pub fn from_parts(
        source: Box<dyn BlockSource>,
        codec: Box<dyn CoeffDecoder>,
        layout: SlideLayout,
    ) -> IsyntaxResult<Self> {
        crate::init();
        layout.validate()?;
        let (pyramid, tiles) = Pyramid::from_layout(&layout);
        log::debug!(
            "slide assembled: {} levels, {} tiles, {}x{} blocks",
            layout.levels.len(),
            tiles.len(),
            layout.block_width,
            layout.block_height
        );
        let plane_len = layout.block_width as usize * layout.block_height as usize;
        Ok(Self {
            source,
            codec,
            idwt: Box::new(LiftingIdwt),
            pyramid,
            tiles: SharedTileTable::new(parking_lot::Mutex::new(tiles)),
            codeblocks: layout.codeblocks,
            data_chunks: layout.data_chunks,
            properties: layout.properties,
            label_image: layout.label_image,
            macro_image: layout.macro_image,
            compressor_version: layout.compressor_version,
            data_model_major_version: layout.data_model_major_version,
            ll_dummy: vec![DUMMY_LL_VALUE; plane_len].into_boxed_slice(),
            h_dummy: vec![0i16; plane_len * 3].into_boxed_slice(),
            binding: OnceLock::new(),
        })
    }

    /// Swap in a different synthesis primitive, e.g. a vendor kernel for a
    /// wavelet family the built-in lifting does not cover.
    pub fn with_idwt_kernel(mut self, kernel: Box<dyn IdwtKernel>) -> Self {
        self.idwt = kernel;
        self
    }

    // --- metadata getters ---

    pub fn tile_width(&self) -> u32 {
        self.pyramid.tile_width
    }

    pub fn tile_height(&self) -> u32 {
        self.pyramid.tile_height
    }

    pub fn level_count(&self) -> u32 {
        self.pyramid.level_count()
    }

    pub fn max_scale(&self) -> u32 {
        self.pyramid.max_scale()
    }

    pub fn level(&self, scale: u32) -> Option<&Level> {
        self.pyramid.level(scale)
    }

    pub fn levels(&self) -> &[Level] {
        self.pyramid.levels()
    }

    /// Level-0 pixel dimensions as reported by the container.
    pub fn dimensions(&self) -> (u32, u32) {
        (self.properties.width, self.properties.height)
    }

    pub fn properties(&self) -> &SlideProperties {
        &self.properties
    }

    pub fn barcode(&self) -> Option<&str> {
        self.properties.barcode.as_deref()
    }

    pub fn mpp_x(&self) -> Option<f64> {
        self.properties.mpp_x
    }

    pub fn mpp_y(&self) -> Option<f64> {
        self.properties.mpp_y
    }

    pub fn data_model_major_version(&self) -> i32 {
        self.data_model_major_version
    }

    /// Slide properties and level geometry as a JSON document.
    pub fn properties_json(&self) -> IsyntaxResult<String> {
        let levels: Vec<_> = self
            .pyramid
            .levels()
            .iter()
            .map(|level| {
                serde_json::json!({
                    "scale": level.scale,
                    "width_in_tiles": level.width_in_tiles,
                    "height_in_tiles": level.height_in_tiles,
                    "downsample": level.downsample_factor,
                    "um_per_pixel_x": level.um_per_pixel_x,
                    "um_per_pixel_y": level.um_per_pixel_y,
                })
            })
            .collect();
        let document = serde_json::json!({
            "properties": self.properties,
            "tile_width": self.tile_width(),
            "tile_height": self.tile_height(),
            "level_count": self.level_count(),
            "levels": levels,
        });
        serde_json::to_string(&document)
            .map_err(|e| IsyntaxError::Fatal(format!("properties serialization failed: {}", e)))
    }

    // --- embedded images ---

    /// The label image as stored: a JPEG byte stream, untouched.
    pub fn read_label_image_jpeg(&self) -> IsyntaxResult<Bytes> {
        self.read_embedded(self.label_image, "label image")
    }

    /// The macro image as stored: a JPEG byte stream, untouched.
    pub fn read_macro_image_jpeg(&self) -> IsyntaxResult<Bytes> {
        self.read_embedded(self.macro_image, "macro image")
    }

    /// Decode the label image to RGB bytes plus dimensions.
    pub fn decode_label_image(&self) -> IsyntaxResult<(Vec<u8>, u32, u32)> {
        let jpeg = self.read_label_image_jpeg()?;
        decode_jpeg_rgb(&jpeg)
    }

    /// Decode the macro image to RGB bytes plus dimensions.
    pub fn decode_macro_image(&self) -> IsyntaxResult<(Vec<u8>, u32, u32)> {
        let jpeg = self.read_macro_image_jpeg()?;
        decode_jpeg_rgb(&jpeg)
    }

    fn read_embedded(&self, image: Option<EmbeddedImage>, what: &str) -> IsyntaxResult<Bytes> {
        let image = image.ok_or_else(|| IsyntaxError::not_found(what.to_string()))?;
        let mut data = vec![0u8; image.size as usize];
        self.source.read_at(image.offset, &mut data)?;
        Ok(Bytes::from(data))
    }

    // --- pixel reads ---

    /// Decode one tile into `buf` (`tile_width * tile_height * 4` bytes,
    /// stride `tile_width * 4`). A tile the container does not store is
    /// not an error: the buffer is filled with opaque white.
    pub fn read_tile(
        &self,
        cache: &SlideCache,
        level: u32,
        tile_x: u32,
        tile_y: u32,
        buf: &mut [u8],
        format: PixelFormat,
    ) -> IsyntaxResult<()> {
        read_tile_impl(self, cache, level, tile_x, tile_y, buf, format)
    }

    /// Decode an arbitrary pixel rectangle of one level into `buf`
    /// (`width * height * 4` bytes, stride `width * 4`).
    pub fn read_region(
        &self,
        cache: &SlideCache,
        level: u32,
        x: i64,
        y: i64,
        width: u32,
        height: u32,
        buf: &mut [u8],
        format: PixelFormat,
    ) -> IsyntaxResult<()> {
        read_region_impl(self, cache, level, x, y, width, height, buf, format)
    }

    // --- engine plumbing ---

    pub(crate) fn pyramid(&self) -> &Pyramid {
        &self.pyramid
    }

    pub(crate) fn shared_tiles(&self) -> SharedTileTable {
        SharedTileTable::clone(&self.tiles)
    }

    pub(crate) fn lock_tiles(&self) -> parking_lot::MutexGuard<'_, TileTable> {
        self.tiles.lock()
    }

    pub(crate) fn source(&self) -> &dyn BlockSource {
        self.source.as_ref()
    }

    pub(crate) fn codec(&self) -> &dyn CoeffDecoder {
        self.codec.as_ref()
    }

    pub(crate) fn idwt(&self) -> &dyn IdwtKernel {
        self.idwt.as_ref()
    }

    pub(crate) fn compressor_version(&self) -> i32 {
        self.compressor_version
    }

    pub(crate) fn codeblock(&self, index: usize) -> IsyntaxResult<&CodeblockEntry> {
        self.codeblocks.get(index).ok_or_else(|| {
            IsyntaxError::Fatal(format!(
                "codeblock index {} outside directory of {}",
                index,
                self.codeblocks.len()
            ))
        })
    }

    pub(crate) fn data_chunk(&self, index: u32) -> IsyntaxResult<&DataChunk> {
        self.data_chunks.get(index as usize).ok_or_else(|| {
            IsyntaxError::Fatal(format!(
                "data chunk index {} outside directory of {}",
                index,
                self.data_chunks.len()
            ))
        })
    }

    pub(crate) fn ll_dummy(&self) -> &[i16] {
        &self.ll_dummy
    }

    pub(crate) fn h_dummy(&self) -> &[i16] {
        &self.h_dummy
    }

    pub(crate) fn bind(&self, cache_id: u64, file: crate::cache::FileId) -> IsyntaxResult<()> {
        self.binding
            .set(CacheBinding { cache_id, file })
            .map_err(|_| IsyntaxError::invalid("slide is already attached to a cache"))
    }

    pub(crate) fn binding(&self) -> Option<&CacheBinding> {
        self.binding.get()
    }
}
