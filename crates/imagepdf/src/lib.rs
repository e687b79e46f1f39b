//! # imagepdf
//!
//! Write a PDF in which every page is one image, sized exactly to that
//! image's pixel dimensions (1 px = 1 pt), optionally followed by a plain
//! text page.
//!
//! ## How images are embedded
//!
//! | Source | Embedding |
//! |--------|-----------|
//! | JPEG, grayscale or RGB | original bytes, `DCTDecode` (no re-encode) |
//! | anything else `image` can decode | 8-bit gray/RGB pixels, zlib, `FlateDecode` |
//!
//! Passing JPEG bytes through untouched keeps scans byte-identical to what
//! the source served. Everything else is stored losslessly.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use imagepdf::{ImagePdfWriter, PageImage};
//!
//! # fn main() -> Result<(), imagepdf::ImagePdfError> {
//! let bytes = std::fs::read("page-001.png").unwrap();
//! let mut writer = ImagePdfWriter::new();
//! writer.add_image_page(&PageImage::from_encoded(&bytes)?)?;
//! writer.add_text_page("Scanned by book2pdf");
//! let pdf: Vec<u8> = writer.finish();
//! # Ok(())
//! # }
//! ```

use std::io::{Cursor, Write};

use flate2::write::ZlibEncoder;
use flate2::Compression;
use image::codecs::jpeg::JpegDecoder;
use image::{ColorType, DynamicImage, ImageDecoder, ImageFormat};
use pdf_writer::{Content, Filter, Finish, Name, Pdf, Rect, Ref, Str, TextStr};
use thiserror::Error;

// ── Public constants ─────────────────────────────────────────────────────────

/// Page size used for a text page when no image page precedes it (A4, points).
pub const DEFAULT_PAGE_SIZE: (f32, f32) = (595.0, 842.0);

const FONT_NAME: Name<'static> = Name(b"F1");

// ── Error type ───────────────────────────────────────────────────────────────

/// Errors returned by imagepdf operations.
#[derive(Error, Debug)]
pub enum ImagePdfError {
    /// The bytes are not in a format the `image` crate recognises.
    #[error("Unrecognised image format: {0}")]
    UnknownFormat(String),

    /// The image header or pixel data could not be decoded.
    #[error("Image decode failed: {0}")]
    Decode(String),

    /// Zero-sized images cannot become a page.
    #[error("Image has zero size ({width}x{height})")]
    EmptyImage { width: u32, height: u32 },

    /// zlib compression of pixel data failed.
    #[error("Pixel compression failed: {0}")]
    Compress(#[source] std::io::Error),
}

// ── Page images ──────────────────────────────────────────────────────────────

/// PDF device colour space of an embedded image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorSpace {
    Gray,
    Rgb,
}

#[derive(Debug, Clone)]
enum Encoding {
    Dct,
    Flate,
}

/// One image, ready to be written as a PDF page.
#[derive(Debug, Clone)]
pub struct PageImage {
    width: u32,
    height: u32,
    color: ColorSpace,
    encoding: Encoding,
    data: Vec<u8>,
}

impl PageImage {
    /// Prepare encoded image bytes (PNG, JPEG, …) for embedding.
    pub fn from_encoded(bytes: &[u8]) -> Result<Self, ImagePdfError> {
        let format =
            image::guess_format(bytes).map_err(|e| ImagePdfError::UnknownFormat(e.to_string()))?;

        if format == ImageFormat::Jpeg {
            if let Some(page) = Self::jpeg_passthrough(bytes)? {
                return Ok(page);
            }
        }

        let decoded = image::load_from_memory_with_format(bytes, format)
            .map_err(|e| ImagePdfError::Decode(e.to_string()))?;
        Self::from_image(&decoded)
    }

    /// Prepare an already decoded image for embedding.
    pub fn from_image(img: &DynamicImage) -> Result<Self, ImagePdfError> {
        let (width, height) = (img.width(), img.height());
        ensure_non_empty(width, height)?;

        let (color, pixels) = match img.color() {
            ColorType::L8 | ColorType::L16 | ColorType::La8 | ColorType::La16 => {
                (ColorSpace::Gray, img.to_luma8().into_raw())
            }
            _ => (ColorSpace::Rgb, img.to_rgb8().into_raw()),
        };

        Ok(Self {
            width,
            height,
            color,
            encoding: Encoding::Flate,
            data: deflate(&pixels)?,
        })
    }

    /// Width in pixels (and in points once placed on a page).
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Height in pixels (and in points once placed on a page).
    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn color_space(&self) -> ColorSpace {
        self.color
    }

    /// Whether the original JPEG stream is embedded as-is.
    pub fn is_passthrough(&self) -> bool {
        matches!(self.encoding, Encoding::Dct)
    }

    /// Read only the JPEG header; keep the stream if PDF can show it directly.
    fn jpeg_passthrough(bytes: &[u8]) -> Result<Option<Self>, ImagePdfError> {
        let decoder =
            JpegDecoder::new(Cursor::new(bytes)).map_err(|e| ImagePdfError::Decode(e.to_string()))?;
        let (width, height) = decoder.dimensions();
        ensure_non_empty(width, height)?;

        let color = match decoder.color_type() {
            ColorType::L8 => ColorSpace::Gray,
            ColorType::Rgb8 => ColorSpace::Rgb,
            _ => return Ok(None),
        };

        Ok(Some(Self {
            width,
            height,
            color,
            encoding: Encoding::Dct,
            data: bytes.to_vec(),
        }))
    }
}

fn ensure_non_empty(width: u32, height: u32) -> Result<(), ImagePdfError> {
    if width == 0 || height == 0 {
        return Err(ImagePdfError::EmptyImage { width, height });
    }
    Ok(())
}

fn deflate(raw: &[u8]) -> Result<Vec<u8>, ImagePdfError> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(raw).map_err(ImagePdfError::Compress)?;
    encoder.finish().map_err(ImagePdfError::Compress)
}

// ── Writer ───────────────────────────────────────────────────────────────────

/// Incremental PDF writer: pages are serialised as they are added, so only
/// the output buffer (not every decoded image) stays in memory.
pub struct ImagePdfWriter {
    pdf: Pdf,
    next_id: i32,
    catalog_ref: Ref,
    page_tree_ref: Ref,
    font_ref: Option<Ref>,
    page_refs: Vec<Ref>,
    last_size: Option<(f32, f32)>,
}

impl Default for ImagePdfWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl ImagePdfWriter {
    pub fn new() -> Self {
        let mut writer = Self {
            pdf: Pdf::new(),
            next_id: 1,
            catalog_ref: Ref::new(1),
            page_tree_ref: Ref::new(1),
            font_ref: None,
            page_refs: Vec::new(),
            last_size: None,
        };
        writer.catalog_ref = writer.alloc();
        writer.page_tree_ref = writer.alloc();
        writer
    }

    /// Record a producer string in the document information dictionary.
    pub fn set_producer(&mut self, producer: &str) {
        let info_ref = self.alloc();
        self.pdf.document_info(info_ref).producer(TextStr(producer));
    }

    /// Number of pages written so far.
    pub fn page_count(&self) -> usize {
        self.page_refs.len()
    }

    /// Size (width, height) in points of the most recent page.
    pub fn last_page_size(&self) -> Option<(f32, f32)> {
        self.last_size
    }

    /// Append a page sized to `image` with the image filling it.
    pub fn add_image_page(&mut self, image: &PageImage) -> Result<(), ImagePdfError> {
        let page_ref = self.alloc();
        let content_ref = self.alloc();
        let image_ref = self.alloc();

        let width = image.width as f32;
        let height = image.height as f32;
        let image_name_str = format!("Im{}", image_ref.get());
        let image_name = Name(image_name_str.as_bytes());

        {
            let mut page = self.pdf.page(page_ref);
            page.media_box(Rect::new(0.0, 0.0, width, height));
            page.parent(self.page_tree_ref);
            page.contents(content_ref);
            let mut resources = page.resources();
            resources.x_objects().pair(image_name, image_ref);
            resources.finish();
            page.finish();
        }

        let mut content = Content::new();
        content.save_state();
        content.transform([width, 0.0, 0.0, height, 0.0, 0.0]);
        content.x_object(image_name);
        content.restore_state();
        self.pdf.stream(content_ref, &content.finish());

        {
            let mut xobject = self.pdf.image_xobject(image_ref, &image.data);
            xobject.filter(match image.encoding {
                Encoding::Dct => Filter::DctDecode,
                Encoding::Flate => Filter::FlateDecode,
            });
            xobject.width(image.width as i32);
            xobject.height(image.height as i32);
            match image.color {
                ColorSpace::Gray => xobject.color_space().device_gray(),
                ColorSpace::Rgb => xobject.color_space().device_rgb(),
            }
            xobject.bits_per_component(8);
            xobject.finish();
        }

        self.page_refs.push(page_ref);
        self.last_size = Some((width, height));
        Ok(())
    }

    /// Append a page with `text` centred on it. The page takes the size of
    /// the previous page, or [`DEFAULT_PAGE_SIZE`] when it is the first.
    ///
    /// Text is drawn in Helvetica; characters outside printable ASCII are
    /// replaced with `?`. Lines are split on `\n`.
    pub fn add_text_page(&mut self, text: &str) {
        let (width, height) = self.last_size.unwrap_or(DEFAULT_PAGE_SIZE);
        let font_ref = self.font();
        let page_ref = self.alloc();
        let content_ref = self.alloc();

        {
            let mut page = self.pdf.page(page_ref);
            page.media_box(Rect::new(0.0, 0.0, width, height));
            page.parent(self.page_tree_ref);
            page.contents(content_ref);
            let mut resources = page.resources();
            resources.fonts().pair(FONT_NAME, font_ref);
            resources.finish();
            page.finish();
        }

        let font_size = (width.min(height) / 30.0).clamp(8.0, 36.0);
        let leading = font_size * 1.4;
        let lines: Vec<Vec<u8>> = text.lines().map(to_printable_ascii).collect();
        let block_height = leading * lines.len().saturating_sub(1) as f32;
        let top = height / 2.0 + block_height / 2.0;

        let mut content = Content::new();
        content.begin_text();
        content.set_font(FONT_NAME, font_size);
        for (i, line) in lines.iter().enumerate() {
            let x = ((width - approx_text_width(line.len(), font_size)) / 2.0).max(0.0);
            let y = top - leading * i as f32;
            content.set_text_matrix([1.0, 0.0, 0.0, 1.0, x, y]);
            content.show(Str(line.as_slice()));
        }
        content.end_text();
        self.pdf.stream(content_ref, &content.finish());

        self.page_refs.push(page_ref);
        self.last_size = Some((width, height));
    }

    /// Write the page tree and catalog and return the PDF bytes.
    pub fn finish(mut self) -> Vec<u8> {
        let count = self.page_refs.len() as i32;
        self.pdf
            .pages(self.page_tree_ref)
            .kids(self.page_refs.iter().copied())
            .count(count);
        self.pdf.catalog(self.catalog_ref).pages(self.page_tree_ref);
        self.pdf.finish()
    }

    fn alloc(&mut self) -> Ref {
        let r = Ref::new(self.next_id);
        self.next_id += 1;
        r
    }

    fn font(&mut self) -> Ref {
        if let Some(r) = self.font_ref {
            return r;
        }
        let r = self.alloc();
        self.pdf.type1_font(r).base_font(Name(b"Helvetica"));
        self.font_ref = Some(r);
        r
    }
}

fn to_printable_ascii(line: &str) -> Vec<u8> {
    line.chars()
        .map(|c| if (' '..='~').contains(&c) { c as u8 } else { b'?' })
        .collect()
}

/// Helvetica averages a little over half an em per glyph.
fn approx_text_width(chars: usize, font_size: f32) -> f32 {
    chars as f32 * font_size * 0.52
}

// ── Tests ─────────────────────────────────────────────────────────────────────
