// cardsheet: Generate print-ready card sheets from weighted random image pools

use clap::{Parser, ValueEnum};
use image::{imageops, ImageFormat, ImageReader, Rgb, RgbImage, Rgba, RgbaImage};
use log::{info, warn};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::io::{Cursor, Read};
use thiserror::Error;

// ============================================================================
// Constants
// ============================================================================

/// DIN A4 dimensions at 300 DPI
const DEFAULT_PAGE_WIDTH: u32 = 2480;
const DEFAULT_PAGE_HEIGHT: u32 = 3508;

/// Grid columns per page
const DEFAULT_IMAGES_PER_ROW: u32 = 6;

/// Default A-type rarity weights (percent)
const DEFAULT_A_COMMON: f64 = 70.0;
const DEFAULT_A_UNCOMMON: f64 = 25.0;
const DEFAULT_A_LEGENDARY: f64 = 5.0;

/// Default B-type special chance (percent)
const DEFAULT_B_SPECIAL: f64 = 10.0;

const DEFAULT_OUTPUT: &str = "mixed_sheet.png";

/// Page background, also shows through blank cells
const BACKGROUND: Rgb<u8> = Rgb([255, 255, 255]);

// ============================================================================
// Error Handling
// ============================================================================

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("Asset error: {0}")]
    Asset(String),
    #[error("Duplex pools out of balance: {0}")]
    Consistency(String),
    #[error("Failed to write page: {0}")]
    Write(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

// ============================================================================
// Data Structures
// ============================================================================

/// CLI Arguments
#[derive(Parser, Debug)]
#[command(version, about = "Generate print-ready card sheets from weighted random image pools")]
struct Args {
    /// Common A-type image (file path or URL)
    #[arg(long, required_unless_present = "config")]
    common: Option<String>,

    /// Uncommon A-type image (file path or URL)
    #[arg(long, required_unless_present = "config")]
    uncommon: Option<String>,

    /// Legendary A-type image (file path or URL)
    #[arg(long, required_unless_present = "config")]
    legendary: Option<String>,

    /// Normal B-type image (file path or URL)
    #[arg(long, required_unless_present = "config")]
    normal: Option<String>,

    /// Special B-type image (file path or URL)
    #[arg(long, required_unless_present = "config")]
    special: Option<String>,

    /// Common A-type weight (default 70)
    #[arg(long)]
    a_common: Option<f64>,

    /// Uncommon A-type weight (default 25)
    #[arg(long)]
    a_uncommon: Option<f64>,

    /// Legendary A-type weight (default 5)
    #[arg(long)]
    a_legendary: Option<f64>,

    /// B-type special chance percent (default 10)
    #[arg(long)]
    b_special: Option<f64>,

    /// Output policy: mirrored front/back page sets, or one interleaved set
    #[arg(long, value_enum, required_unless_present = "config")]
    mode: Option<SheetMode>,

    /// Deck size; odd values round up to the next even count.
    /// Omitted, the deck fills exactly one page.
    #[arg(long)]
    total_images: Option<u32>,

    /// Grid columns per page (default 6)
    #[arg(long)]
    images_per_row: Option<u32>,

    /// Page width in pixels (default 2480)
    #[arg(long)]
    width: Option<u32>,

    /// Page height in pixels (default 3508)
    #[arg(long)]
    height: Option<u32>,

    /// Output filename; page and pool suffixes are appended
    #[arg(short, long)]
    output: Option<String>,

    /// Configuration file (JSON); command-line flags override its values
    #[arg(short, long)]
    config: Option<String>,

    /// Write the resolved configuration to this file
    #[arg(long)]
    save_config: Option<String>,

    /// RNG seed for reproducible sheets
    #[arg(long)]
    seed: Option<u64>,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum SheetMode {
    /// Separate A and B page sets, B mirrored for double-sided printing
    Duplex,
    /// A and B picks shuffled together onto one page set
    Interleaved,
}

/// Configuration file schema
#[derive(Debug, Serialize, Deserialize)]
struct ConfigFile {
    paths: PathsSection,
    distribution: DistributionSection,
    output: OutputSection,
}

#[derive(Debug, Serialize, Deserialize)]
struct PathsSection {
    a_common: String,
    a_uncommon: String,
    a_legendary: String,
    b_normal: String,
    b_special: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct DistributionSection {
    a_common: f64,
    a_uncommon: f64,
    a_legendary: f64,
    b_special: f64,
}

#[derive(Debug, Serialize, Deserialize)]
struct OutputSection {
    filename: String,
    total_images: Option<u32>,
    width: u32,
    height: u32,
    images_per_row: u32,
    duplex_mode: bool,
}

/// The five source image locations, file paths or URLs
struct AssetSources {
    common: String,
    uncommon: String,
    legendary: String,
    normal: String,
    special: String,
}

/// Resolved, validated settings for one generation run
struct Settings {
    sources: AssetSources,
    distribution: Distribution,
    filename: String,
    total_images: Option<u32>,
    width: u32,
    height: u32,
    images_per_row: u32,
    mode: SheetMode,
    seed: Option<u64>,
}

/// Rarity weights for the A pool and the special chance for the B pool.
/// Constructed through `new`, so a value in hand is always valid.
#[derive(Debug, Clone, Copy)]
struct Distribution {
    a_common: f64,
    a_uncommon: f64,
    a_legendary: f64,
    b_special: f64,
}

impl Distribution {
    fn new(
        a_common: f64,
        a_uncommon: f64,
        a_legendary: f64,
        b_special: f64,
    ) -> Result<Self, AppError> {
        for (name, weight) in [
            ("a_common", a_common),
            ("a_uncommon", a_uncommon),
            ("a_legendary", a_legendary),
        ] {
            if !weight.is_finite() || weight < 0.0 {
                return Err(AppError::Config(format!(
                    "weight {} must be a non-negative number, got {}",
                    name, weight
                )));
            }
        }
        if a_common + a_uncommon + a_legendary == 0.0 {
            return Err(AppError::Config(
                "A-type weights cannot all be zero".to_string(),
            ));
        }
        if !b_special.is_finite() || !(0.0..=100.0).contains(&b_special) {
            return Err(AppError::Config(format!(
                "b_special must be between 0 and 100, got {}",
                b_special
            )));
        }
        Ok(Distribution {
            a_common,
            a_uncommon,
            a_legendary,
            b_special,
        })
    }

    fn a_total(&self) -> f64 {
        self.a_common + self.a_uncommon + self.a_legendary
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rarity {
    Common,
    Uncommon,
    Legendary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Variant {
    Normal,
    Special,
}

/// One resolved pick, from either pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CardFace {
    A(Rarity),
    B(Variant),
}

// ============================================================================
// Main Entry Point
// ============================================================================

fn main() {
    env_logger::init();
    if let Err(e) = run() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<(), AppError> {
    let args = Args::parse();
    let save_config = args.save_config.clone();

    let settings = resolve_settings(args)?;

    // Everything that can fail cheaply fails here, before any pixel work
    let pool = AssetPool::load(&settings.sources)?;
    let geometry = SheetGeometry::new(settings.width, settings.height, settings.images_per_row)?;

    if let Some(path) = &save_config {
        save_config_file(&settings, path)?;
    }

    let total = settings.total_images.unwrap_or(geometry.capacity() as u32);

    let mut rng = match settings.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    let deck = build_deck(total, &settings.distribution, &mut rng);
    if let Some(requested) = deck.rounded_from {
        warn!(
            "total_images {} is odd, rounded up to {}",
            requested,
            deck.card_count()
        );
    }

    info!(
        "dealing {} cards onto {}x{} pages, {} per row ({} cells per page)",
        deck.card_count(),
        geometry.width,
        geometry.height,
        geometry.columns,
        geometry.capacity()
    );

    let assets = ScaledAssets::prepare(&pool, geometry.cell);

    let written = match settings.mode {
        SheetMode::Duplex => generate_duplex(&deck, &geometry, &assets, &settings.filename)?,
        SheetMode::Interleaved => {
            generate_interleaved(&deck, &geometry, &assets, &settings.filename, &mut rng)?
        }
    };

    println!("✓ Generated {} page file(s):", written.len());
    for path in &written {
        println!("  {}", path);
    }
    let (common, uncommon, legendary) = deck.rarity_counts();
    let (normal, special) = deck.variant_counts();
    println!(
        "  Cards: {} ({} A-type, {} B-type)",
        deck.card_count(),
        deck.a_picks.len(),
        deck.b_picks.len()
    );
    println!(
        "  A-type: {} common, {} uncommon, {} legendary",
        common, uncommon, legendary
    );
    println!("  B-type: {} normal, {} special", normal, special);

    Ok(())
}

// ============================================================================
// Configuration
// ============================================================================

fn resolve_settings(args: Args) -> Result<Settings, AppError> {
    let file = match &args.config {
        Some(path) => Some(load_config_file(path)?),
        None => None,
    };
    let (file_paths, file_dist, file_out) = match file {
        Some(ConfigFile {
            paths,
            distribution,
            output,
        }) => (Some(paths), Some(distribution), Some(output)),
        None => (None, None, None),
    };

    fn pick<T>(cli: Option<T>, cfg: Option<T>) -> Option<T> {
        cli.or(cfg)
    }

    fn missing(flag: &str) -> AppError {
        AppError::Config(format!(
            "no source image for --{} (pass the flag or use --config)",
            flag
        ))
    }

    let sources = AssetSources {
        common: pick(args.common, file_paths.as_ref().map(|p| p.a_common.clone()))
            .ok_or_else(|| missing("common"))?,
        uncommon: pick(
            args.uncommon,
            file_paths.as_ref().map(|p| p.a_uncommon.clone()),
        )
        .ok_or_else(|| missing("uncommon"))?,
        legendary: pick(
            args.legendary,
            file_paths.as_ref().map(|p| p.a_legendary.clone()),
        )
        .ok_or_else(|| missing("legendary"))?,
        normal: pick(args.normal, file_paths.as_ref().map(|p| p.b_normal.clone()))
            .ok_or_else(|| missing("normal"))?,
        special: pick(
            args.special,
            file_paths.as_ref().map(|p| p.b_special.clone()),
        )
        .ok_or_else(|| missing("special"))?,
    };

    let distribution = Distribution::new(
        pick(args.a_common, file_dist.as_ref().map(|d| d.a_common)).unwrap_or(DEFAULT_A_COMMON),
        pick(args.a_uncommon, file_dist.as_ref().map(|d| d.a_uncommon))
            .unwrap_or(DEFAULT_A_UNCOMMON),
        pick(args.a_legendary, file_dist.as_ref().map(|d| d.a_legendary))
            .unwrap_or(DEFAULT_A_LEGENDARY),
        pick(args.b_special, file_dist.as_ref().map(|d| d.b_special)).unwrap_or(DEFAULT_B_SPECIAL),
    )?;

    // The output policy carries no default: it must come from the command
    // line or from the file's duplex_mode field
    let file_mode = file_out.as_ref().map(|o| {
        if o.duplex_mode {
            SheetMode::Duplex
        } else {
            SheetMode::Interleaved
        }
    });
    let mode = pick(args.mode, file_mode).ok_or_else(|| {
        AppError::Config(
            "output mode is required: pass --mode duplex|interleaved or set output.duplex_mode"
                .to_string(),
        )
    })?;

    let total_images = pick(
        args.total_images,
        file_out.as_ref().and_then(|o| o.total_images),
    );
    if total_images == Some(0) {
        return Err(AppError::Config(
            "total_images must be positive".to_string(),
        ));
    }

    Ok(Settings {
        sources,
        distribution,
        filename: pick(args.output, file_out.as_ref().map(|o| o.filename.clone()))
            .unwrap_or_else(|| DEFAULT_OUTPUT.to_string()),
        total_images,
        width: pick(args.width, file_out.as_ref().map(|o| o.width)).unwrap_or(DEFAULT_PAGE_WIDTH),
        height: pick(args.height, file_out.as_ref().map(|o| o.height))
            .unwrap_or(DEFAULT_PAGE_HEIGHT),
        images_per_row: pick(
            args.images_per_row,
            file_out.as_ref().map(|o| o.images_per_row),
        )
        .unwrap_or(DEFAULT_IMAGES_PER_ROW),
        mode,
        seed: args.seed,
    })
}

fn load_config_file(path: &str) -> Result<ConfigFile, AppError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| AppError::Config(format!("could not read config file {}: {}", path, e)))?;
    serde_json::from_str(&content)
        .map_err(|e| AppError::Config(format!("invalid config file {}: {}", path, e)))
}

fn save_config_file(settings: &Settings, path: &str) -> Result<(), AppError> {
    let file = ConfigFile {
        paths: PathsSection {
            a_common: settings.sources.common.clone(),
            a_uncommon: settings.sources.uncommon.clone(),
            a_legendary: settings.sources.legendary.clone(),
            b_normal: settings.sources.normal.clone(),
            b_special: settings.sources.special.clone(),
        },
        distribution: DistributionSection {
            a_common: settings.distribution.a_common,
            a_uncommon: settings.distribution.a_uncommon,
            a_legendary: settings.distribution.a_legendary,
            b_special: settings.distribution.b_special,
        },
        output: OutputSection {
            filename: settings.filename.clone(),
            total_images: settings.total_images,
            width: settings.width,
            height: settings.height,
            images_per_row: settings.images_per_row,
            duplex_mode: settings.mode == SheetMode::Duplex,
        },
    };
    let json = serde_json::to_string_pretty(&file)
        .map_err(|e| AppError::Config(format!("could not serialize configuration: {}", e)))?;
    std::fs::write(path, json)?;
    info!("configuration saved to {}", path);
    Ok(())
}

// ============================================================================
// Asset Loading
// ============================================================================

/// The five decoded source images, validated square and uniformly sized
struct AssetPool {
    common: RgbaImage,
    uncommon: RgbaImage,
    legendary: RgbaImage,
    normal: RgbaImage,
    special: RgbaImage,
}

impl AssetPool {
    fn load(sources: &AssetSources) -> Result<Self, AppError> {
        let pool = AssetPool {
            common: load_asset(&sources.common, "A-type common")?,
            uncommon: load_asset(&sources.uncommon, "A-type uncommon")?,
            legendary: load_asset(&sources.legendary, "A-type legendary")?,
            normal: load_asset(&sources.normal, "B-type normal")?,
            special: load_asset(&sources.special, "B-type special")?,
        };

        let mut side = None;
        for (name, image) in pool.entries() {
            let (w, h) = image.dimensions();
            if w != h {
                return Err(AppError::Asset(format!(
                    "{} image must be square, got {}x{}",
                    name, w, h
                )));
            }
            match side {
                None => side = Some(w),
                Some(s) if s != w => {
                    return Err(AppError::Asset(format!(
                        "{} image is {}x{} but other assets are {}x{}",
                        name, w, h, s, s
                    )));
                }
                Some(_) => {}
            }
        }

        Ok(pool)
    }

    fn entries(&self) -> [(&'static str, &RgbaImage); 5] {
        [
            ("A-type common", &self.common),
            ("A-type uncommon", &self.uncommon),
            ("A-type legendary", &self.legendary),
            ("B-type normal", &self.normal),
            ("B-type special", &self.special),
        ]
    }
}

fn load_asset(source: &str, name: &str) -> Result<RgbaImage, AppError> {
    let bytes = if source.starts_with("http://") || source.starts_with("https://") {
        // Load from URL
        let response = ureq::get(source)
            .call()
            .map_err(|e| AppError::Asset(format!("{}: failed to fetch {}: {}", name, source, e)))?;

        let mut bytes = Vec::new();
        response
            .into_reader()
            .read_to_end(&mut bytes)
            .map_err(|e| AppError::Asset(format!("{}: failed to read {}: {}", name, source, e)))?;
        bytes
    } else {
        // Load from file
        std::fs::read(source)
            .map_err(|e| AppError::Asset(format!("{}: {}: {}", name, source, e)))?
    };

    let reader = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| AppError::Asset(format!("{}: {}: {}", name, source, e)))?;
    if reader.format() != Some(ImageFormat::Png) {
        return Err(AppError::Asset(format!(
            "{}: {} is not a PNG file",
            name, source
        )));
    }
    let image = reader
        .decode()
        .map_err(|e| AppError::Asset(format!("{}: failed to decode {}: {}", name, source, e)))?;

    Ok(image.to_rgba8())
}

// ============================================================================
// Distribution Sampler
// ============================================================================

/// Cumulative-weight selection against a uniform draw in [0, sum).
/// A zero weight can never be selected.
fn draw_rarity(distribution: &Distribution, rng: &mut impl Rng) -> Rarity {
    let roll = rng.gen_range(0.0..distribution.a_total());
    if roll < distribution.a_common {
        Rarity::Common
    } else if roll < distribution.a_common + distribution.a_uncommon {
        Rarity::Uncommon
    } else {
        Rarity::Legendary
    }
}

fn draw_variant(distribution: &Distribution, rng: &mut impl Rng) -> Variant {
    if rng.gen_range(0.0..100.0) < distribution.b_special {
        Variant::Special
    } else {
        Variant::Normal
    }
}

// ============================================================================
// Deck Building
// ============================================================================

/// One run's resolved picks. The two pools always hold the same count.
struct Deck {
    a_picks: Vec<Rarity>,
    b_picks: Vec<Variant>,
    /// The requested total when it had to be rounded up to an even count
    rounded_from: Option<u32>,
}

impl Deck {
    fn card_count(&self) -> usize {
        self.a_picks.len() + self.b_picks.len()
    }

    fn rarity_counts(&self) -> (usize, usize, usize) {
        let mut counts = (0, 0, 0);
        for rarity in &self.a_picks {
            match rarity {
                Rarity::Common => counts.0 += 1,
                Rarity::Uncommon => counts.1 += 1,
                Rarity::Legendary => counts.2 += 1,
            }
        }
        counts
    }

    fn variant_counts(&self) -> (usize, usize) {
        let special = self
            .b_picks
            .iter()
            .filter(|v| **v == Variant::Special)
            .count();
        (self.b_picks.len() - special, special)
    }
}

/// Draws each pick independently (repeats expected), then shuffles each
/// pool so identical rarities do not cluster.
fn build_deck(total_images: u32, distribution: &Distribution, rng: &mut impl Rng) -> Deck {
    let rounded = total_images % 2 != 0;
    let total = if rounded { total_images + 1 } else { total_images };
    let per_pool = (total / 2) as usize;

    let mut a_picks: Vec<Rarity> = (0..per_pool)
        .map(|_| draw_rarity(distribution, rng))
        .collect();
    let mut b_picks: Vec<Variant> = (0..per_pool)
        .map(|_| draw_variant(distribution, rng))
        .collect();

    a_picks.shuffle(rng);
    b_picks.shuffle(rng);

    Deck {
        a_picks,
        b_picks,
        rounded_from: rounded.then_some(total_images),
    }
}

// ============================================================================
// Grid Layout
// ============================================================================

/// Page and grid geometry, shared by every page of a run.
/// Cells are square: the edge is the page width split across the columns,
/// and the row count is however many such cells the height fits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SheetGeometry {
    width: u32,
    height: u32,
    columns: u32,
    cell: u32,
    rows: u32,
}

impl SheetGeometry {
    fn new(width: u32, height: u32, columns: u32) -> Result<Self, AppError> {
        if columns == 0 {
            return Err(AppError::Config(
                "images_per_row must be at least 1".to_string(),
            ));
        }
        let cell = width / columns;
        if cell == 0 {
            return Err(AppError::Config(format!(
                "page width {} cannot fit {} columns",
                width, columns
            )));
        }
        let rows = height / cell;
        if rows == 0 {
            return Err(AppError::Config(format!(
                "page height {} cannot fit a row of {}px cells",
                height, cell
            )));
        }
        Ok(SheetGeometry {
            width,
            height,
            columns,
            cell,
            rows,
        })
    }

    fn capacity(&self) -> usize {
        (self.columns * self.rows) as usize
    }
}

/// One page worth of cell assignments, row-major.
/// Unassigned cells stay blank on the rendered page.
struct PageGrid {
    cells: Vec<Option<CardFace>>,
}

/// Partitions the picks into consecutive page-sized chunks, filling each
/// page left to right, then top to bottom.
fn layout(faces: &[CardFace], geometry: &SheetGeometry) -> Vec<PageGrid> {
    let capacity = geometry.capacity();
    faces
        .chunks(capacity)
        .map(|chunk| {
            let mut cells = vec![None; capacity];
            for (cell, face) in cells.iter_mut().zip(chunk) {
                *cell = Some(*face);
            }
            PageGrid { cells }
        })
        .collect()
}

// ============================================================================
// Duplex Mirror
// ============================================================================

/// Reverses every row of every page, moving the cell in column c to
/// column `columns - 1 - c`. A sheet printed with these pages on the back
/// lines each B card up behind its A counterpart once the paper flips
/// along its vertical axis.
fn mirror_pages(pages: &mut [PageGrid], columns: u32) {
    for page in pages {
        for row in page.cells.chunks_mut(columns as usize) {
            row.reverse();
        }
    }
}

// ============================================================================
// Page Rendering
// ============================================================================

/// An asset scaled once for the run's cell size, with centering offsets
struct CellArt {
    image: RgbImage,
    offset_x: i64,
    offset_y: i64,
}

impl CellArt {
    fn scale(asset: &RgbaImage, cell: u32) -> Self {
        let (width, height) = asset.dimensions();
        let (scaled_w, scaled_h) = fit_cell(width, height, cell);
        let resized = imageops::resize(asset, scaled_w, scaled_h, imageops::FilterType::Lanczos3);
        CellArt {
            image: flatten_onto_white(&resized),
            offset_x: ((cell - scaled_w) / 2) as i64,
            offset_y: ((cell - scaled_h) / 2) as i64,
        }
    }
}

/// The five assets pre-scaled for pasting, one per card face
struct ScaledAssets {
    common: CellArt,
    uncommon: CellArt,
    legendary: CellArt,
    normal: CellArt,
    special: CellArt,
}

impl ScaledAssets {
    fn prepare(pool: &AssetPool, cell: u32) -> Self {
        ScaledAssets {
            common: CellArt::scale(&pool.common, cell),
            uncommon: CellArt::scale(&pool.uncommon, cell),
            legendary: CellArt::scale(&pool.legendary, cell),
            normal: CellArt::scale(&pool.normal, cell),
            special: CellArt::scale(&pool.special, cell),
        }
    }

    fn for_face(&self, face: CardFace) -> &CellArt {
        match face {
            CardFace::A(Rarity::Common) => &self.common,
            CardFace::A(Rarity::Uncommon) => &self.uncommon,
            CardFace::A(Rarity::Legendary) => &self.legendary,
            CardFace::B(Variant::Normal) => &self.normal,
            CardFace::B(Variant::Special) => &self.special,
        }
    }
}

/// Scale preserving aspect ratio so the larger dimension exactly fills
/// the cell edge. Square sources fill the cell completely; anything else
/// is letterboxed, never cropped or stretched.
fn fit_cell(width: u32, height: u32, cell: u32) -> (u32, u32) {
    let aspect_ratio = width as f64 / height as f64;
    if width >= height {
        let scaled_h = (cell as f64 / aspect_ratio).round() as u32;
        (cell, scaled_h.max(1))
    } else {
        let scaled_w = (cell as f64 * aspect_ratio).round() as u32;
        (scaled_w.max(1), cell)
    }
}

/// Composite an RGBA image against a white background
fn flatten_onto_white(rgba: &RgbaImage) -> RgbImage {
    let (width, height) = rgba.dimensions();
    let mut rgb = RgbImage::new(width, height);
    for (x, y, pixel) in rgba.enumerate_pixels() {
        let Rgba([r, g, b, a]) = *pixel;
        let alpha = a as f32 / 255.0;
        let bg = 255.0;
        let out_r = (r as f32 * alpha + bg * (1.0 - alpha)) as u8;
        let out_g = (g as f32 * alpha + bg * (1.0 - alpha)) as u8;
        let out_b = (b as f32 * alpha + bg * (1.0 - alpha)) as u8;
        rgb.put_pixel(x, y, Rgb([out_r, out_g, out_b]));
    }
    rgb
}

fn render_page(grid: &PageGrid, assets: &ScaledAssets, geometry: &SheetGeometry) -> RgbImage {
    let mut canvas = RgbImage::from_pixel(geometry.width, geometry.height, BACKGROUND);
    for (index, cell) in grid.cells.iter().enumerate() {
        if let Some(face) = cell {
            let art = assets.for_face(*face);
            let column = (index as u32 % geometry.columns) as i64;
            let row = (index as u32 / geometry.columns) as i64;
            let x = column * geometry.cell as i64 + art.offset_x;
            let y = row * geometry.cell as i64 + art.offset_y;
            imageops::replace(&mut canvas, &art.image, x, y);
        }
    }
    canvas
}

// ============================================================================
// Page Writing
// ============================================================================

/// Strip a trailing .png so page and pool suffixes can be appended
fn output_stem(filename: &str) -> &str {
    filename.strip_suffix(".png").unwrap_or(filename)
}

fn page_file_name(stem: &str, pool: Option<char>, index: usize, page_count: usize) -> String {
    match (pool, page_count) {
        (Some(pool), 1) => format!("{}_page_{}.png", stem, pool),
        (Some(pool), _) => format!("{}_page_{}_{}.png", stem, pool, index + 1),
        (None, 1) => format!("{}.png", stem),
        (None, _) => format!("{}_{}.png", stem, index + 1),
    }
}

fn write_pages(
    pages: &[RgbImage],
    stem: &str,
    pool: Option<char>,
) -> Result<Vec<String>, AppError> {
    let mut written = Vec::with_capacity(pages.len());
    for (index, page) in pages.iter().enumerate() {
        let path = page_file_name(stem, pool, index, pages.len());
        page.save(&path)
            .map_err(|e| AppError::Write(format!("{}: {}", path, e)))?;
        written.push(path);
    }
    Ok(written)
}

// ============================================================================
// Sheet Generation
// ============================================================================

fn generate_duplex(
    deck: &Deck,
    geometry: &SheetGeometry,
    assets: &ScaledAssets,
    filename: &str,
) -> Result<Vec<String>, AppError> {
    if deck.a_picks.len() != deck.b_picks.len() {
        return Err(AppError::Consistency(format!(
            "{} A-type picks vs {} B-type picks",
            deck.a_picks.len(),
            deck.b_picks.len()
        )));
    }

    let a_faces: Vec<CardFace> = deck.a_picks.iter().map(|r| CardFace::A(*r)).collect();
    let b_faces: Vec<CardFace> = deck.b_picks.iter().map(|v| CardFace::B(*v)).collect();

    let a_pages = layout(&a_faces, geometry);
    let mut b_pages = layout(&b_faces, geometry);
    // B pages share the A placement order, then flip for register
    mirror_pages(&mut b_pages, geometry.columns);

    // Render every page before writing the first file, so a failure
    // leaves nothing on disk
    let a_rendered: Vec<RgbImage> = a_pages
        .iter()
        .map(|p| render_page(p, assets, geometry))
        .collect();
    let b_rendered: Vec<RgbImage> = b_pages
        .iter()
        .map(|p| render_page(p, assets, geometry))
        .collect();

    let stem = output_stem(filename);
    let mut written = write_pages(&a_rendered, stem, Some('A'))?;
    written.extend(write_pages(&b_rendered, stem, Some('B'))?);
    Ok(written)
}

fn generate_interleaved(
    deck: &Deck,
    geometry: &SheetGeometry,
    assets: &ScaledAssets,
    filename: &str,
    rng: &mut impl Rng,
) -> Result<Vec<String>, AppError> {
    let mut faces: Vec<CardFace> = deck
        .a_picks
        .iter()
        .map(|r| CardFace::A(*r))
        .chain(deck.b_picks.iter().map(|v| CardFace::B(*v)))
        .collect();
    faces.shuffle(rng);

    let pages = layout(&faces, geometry);
    let rendered: Vec<RgbImage> = pages
        .iter()
        .map(|p| render_page(p, assets, geometry))
        .collect();

    write_pages(&rendered, output_stem(filename), None)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn rng(seed: u64) -> StdRng {
        StdRng::seed_from_u64(seed)
    }

    fn distribution() -> Distribution {
        Distribution::new(70.0, 25.0, 5.0, 10.0).unwrap()
    }

    fn solid(side: u32, color: Rgba<u8>) -> RgbaImage {
        RgbaImage::from_pixel(side, side, color)
    }

    #[test]
    fn rarity_draws_converge_to_weights() {
        let dist = distribution();
        let mut rng = rng(42);
        let mut counts = [0usize; 3];
        let draws = 10_000;
        for _ in 0..draws {
            match draw_rarity(&dist, &mut rng) {
                Rarity::Common => counts[0] += 1,
                Rarity::Uncommon => counts[1] += 1,
                Rarity::Legendary => counts[2] += 1,
            }
        }
        let percent = |count: usize| count as f64 * 100.0 / draws as f64;
        assert!((percent(counts[0]) - 70.0).abs() < 2.0);
        assert!((percent(counts[1]) - 25.0).abs() < 2.0);
        assert!((percent(counts[2]) - 5.0).abs() < 2.0);
    }

    #[test]
    fn variant_draws_converge_to_probability() {
        let dist = distribution();
        let mut rng = rng(42);
        let draws = 10_000;
        let specials = (0..draws)
            .filter(|_| draw_variant(&dist, &mut rng) == Variant::Special)
            .count();
        let percent = specials as f64 * 100.0 / draws as f64;
        assert!((percent - 10.0).abs() < 2.0);
    }

    #[test]
    fn zero_weight_is_never_drawn() {
        let dist = Distribution::new(50.0, 0.0, 50.0, 0.0).unwrap();
        let mut rng = rng(7);
        for _ in 0..1_000 {
            assert_ne!(draw_rarity(&dist, &mut rng), Rarity::Uncommon);
            assert_eq!(draw_variant(&dist, &mut rng), Variant::Normal);
        }
    }

    #[test]
    fn certain_special_is_always_drawn() {
        let dist = Distribution::new(70.0, 25.0, 5.0, 100.0).unwrap();
        let mut rng = rng(7);
        for _ in 0..1_000 {
            assert_eq!(draw_variant(&dist, &mut rng), Variant::Special);
        }
    }

    #[test]
    fn all_zero_weights_rejected() {
        assert!(matches!(
            Distribution::new(0.0, 0.0, 0.0, 10.0),
            Err(AppError::Config(_))
        ));
    }

    #[test]
    fn negative_weight_rejected() {
        assert!(matches!(
            Distribution::new(-1.0, 25.0, 5.0, 10.0),
            Err(AppError::Config(_))
        ));
    }

    #[test]
    fn special_probability_out_of_range_rejected() {
        assert!(matches!(
            Distribution::new(70.0, 25.0, 5.0, 100.5),
            Err(AppError::Config(_))
        ));
        assert!(matches!(
            Distribution::new(70.0, 25.0, 5.0, -1.0),
            Err(AppError::Config(_))
        ));
    }

    #[test]
    fn deck_pools_are_equal_halves() {
        let dist = distribution();
        let deck = build_deck(96, &dist, &mut rng(1));
        assert_eq!(deck.a_picks.len(), 48);
        assert_eq!(deck.b_picks.len(), 48);
        assert!(deck.rounded_from.is_none());
    }

    #[test]
    fn odd_total_rounds_up() {
        let dist = distribution();
        let deck = build_deck(2001, &dist, &mut rng(1));
        assert_eq!(deck.a_picks.len(), 1001);
        assert_eq!(deck.b_picks.len(), 1001);
        assert_eq!(deck.rounded_from, Some(2001));
    }

    #[test]
    fn same_seed_reproduces_deck() {
        let dist = distribution();
        let deck_one = build_deck(200, &dist, &mut rng(99));
        let deck_two = build_deck(200, &dist, &mut rng(99));
        assert_eq!(deck_one.a_picks, deck_two.a_picks);
        assert_eq!(deck_one.b_picks, deck_two.b_picks);
    }

    #[test]
    fn a4_geometry_capacity() {
        let geometry = SheetGeometry::new(2480, 3508, 6).unwrap();
        assert_eq!(geometry.cell, 413);
        assert_eq!(geometry.rows, 8);
        assert_eq!(geometry.capacity(), 48);
    }

    #[test]
    fn zero_columns_rejected() {
        assert!(matches!(
            SheetGeometry::new(2480, 3508, 0),
            Err(AppError::Config(_))
        ));
    }

    #[test]
    fn degenerate_page_rejected() {
        // More columns than the width has pixels
        assert!(matches!(
            SheetGeometry::new(4, 3508, 6),
            Err(AppError::Config(_))
        ));
        // Too short for a single row
        assert!(matches!(
            SheetGeometry::new(2480, 100, 6),
            Err(AppError::Config(_))
        ));
    }

    #[test]
    fn layout_paginates_in_order() {
        let geometry = SheetGeometry::new(600, 600, 6).unwrap();
        let capacity = geometry.capacity();
        // Three and a half pages worth of picks
        let faces = vec![CardFace::B(Variant::Normal); capacity * 7 / 2];
        let pages = layout(&faces, &geometry);
        assert_eq!(pages.len(), 4);
        for page in &pages[..3] {
            assert!(page.cells.iter().all(|c| c.is_some()));
        }
        let filled = pages[3].cells.iter().filter(|c| c.is_some()).count();
        assert_eq!(filled, capacity / 2);
        assert!(pages[3].cells[capacity / 2..].iter().all(|c| c.is_none()));
    }

    #[test]
    fn mirror_reverses_each_row() {
        // 3 columns, 2 rows, 5 picks: the second row is partial
        let geometry = SheetGeometry::new(300, 200, 3).unwrap();
        let faces = vec![
            CardFace::A(Rarity::Common),
            CardFace::A(Rarity::Uncommon),
            CardFace::A(Rarity::Legendary),
            CardFace::B(Variant::Normal),
            CardFace::B(Variant::Special),
        ];
        let mut pages = layout(&faces, &geometry);
        mirror_pages(&mut pages, geometry.columns);

        let cells = &pages[0].cells;
        assert_eq!(cells[0], Some(CardFace::A(Rarity::Legendary)));
        assert_eq!(cells[1], Some(CardFace::A(Rarity::Uncommon)));
        assert_eq!(cells[2], Some(CardFace::A(Rarity::Common)));
        // The partial row shifts to the far columns
        assert_eq!(cells[3], None);
        assert_eq!(cells[4], Some(CardFace::B(Variant::Special)));
        assert_eq!(cells[5], Some(CardFace::B(Variant::Normal)));
    }

    #[test]
    fn mirror_twice_restores_layout() {
        let geometry = SheetGeometry::new(600, 600, 6).unwrap();
        let dist = distribution();
        let deck = build_deck(100, &dist, &mut rng(3));
        let faces: Vec<CardFace> = deck.a_picks.iter().map(|r| CardFace::A(*r)).collect();

        let original = layout(&faces, &geometry);
        let mut mirrored = layout(&faces, &geometry);
        mirror_pages(&mut mirrored, geometry.columns);
        mirror_pages(&mut mirrored, geometry.columns);

        for (before, after) in original.iter().zip(&mirrored) {
            assert_eq!(before.cells, after.cells);
        }
    }

    #[test]
    fn fit_cell_preserves_aspect_ratio() {
        assert_eq!(fit_cell(500, 500, 413), (413, 413));
        // A wide source letterboxes vertically
        assert_eq!(fit_cell(400, 200, 100), (100, 50));
        // A tall source letterboxes horizontally
        assert_eq!(fit_cell(200, 400, 100), (50, 100));
    }

    #[test]
    fn rendered_page_fills_cells_and_leaves_blanks_white() {
        let geometry = SheetGeometry::new(300, 200, 3).unwrap();
        let pool = AssetPool {
            common: solid(50, Rgba([255, 0, 0, 255])),
            uncommon: solid(50, Rgba([0, 255, 0, 255])),
            legendary: solid(50, Rgba([0, 0, 255, 255])),
            normal: solid(50, Rgba([0, 0, 0, 255])),
            special: solid(50, Rgba([128, 128, 128, 255])),
        };
        let assets = ScaledAssets::prepare(&pool, geometry.cell);
        let faces = vec![CardFace::A(Rarity::Common)];
        let pages = layout(&faces, &geometry);
        let rendered = render_page(&pages[0], &assets, &geometry);

        assert_eq!(rendered.dimensions(), (300, 200));
        // Center of the first cell carries the common art
        let Rgb([r, g, _]) = *rendered.get_pixel(50, 50);
        assert!(r > 250 && g < 5);
        // The neighboring cell stays background
        assert_eq!(*rendered.get_pixel(150, 50), Rgb([255, 255, 255]));
    }

    #[test]
    fn transparent_pixels_flatten_to_white() {
        let art = flatten_onto_white(&solid(4, Rgba([0, 0, 0, 0])));
        assert_eq!(*art.get_pixel(0, 0), Rgb([255, 255, 255]));
    }

    #[test]
    fn page_file_names() {
        assert_eq!(page_file_name("deck", Some('A'), 0, 1), "deck_page_A.png");
        assert_eq!(page_file_name("deck", Some('B'), 2, 4), "deck_page_B_3.png");
        assert_eq!(page_file_name("deck", None, 0, 1), "deck.png");
        assert_eq!(page_file_name("deck", None, 1, 3), "deck_2.png");
        assert_eq!(output_stem("deck.png"), "deck");
        assert_eq!(output_stem("deck"), "deck");
    }

    #[test]
    fn config_file_parses() {
        let json = r#"{
            "paths": {
                "a_common": "a.png",
                "a_uncommon": "b.png",
                "a_legendary": "c.png",
                "b_normal": "xp.png",
                "b_special": "xpxd.png"
            },
            "distribution": {
                "a_common": 70,
                "a_uncommon": 25,
                "a_legendary": 5,
                "b_special": 10
            },
            "output": {
                "filename": "out.png",
                "total_images": 96,
                "width": 2480,
                "height": 3508,
                "images_per_row": 6,
                "duplex_mode": true
            }
        }"#;
        let parsed: ConfigFile = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.paths.b_special, "xpxd.png");
        assert_eq!(parsed.output.images_per_row, 6);
        assert!(parsed.output.duplex_mode);
    }

    #[test]
    fn config_without_duplex_mode_rejected() {
        let json = r#"{
            "paths": {
                "a_common": "a.png",
                "a_uncommon": "b.png",
                "a_legendary": "c.png",
                "b_normal": "xp.png",
                "b_special": "xpxd.png"
            },
            "distribution": {
                "a_common": 70,
                "a_uncommon": 25,
                "a_legendary": 5,
                "b_special": 10
            },
            "output": {
                "filename": "out.png",
                "width": 2480,
                "height": 3508,
                "images_per_row": 6
            }
        }"#;
        assert!(serde_json::from_str::<ConfigFile>(json).is_err());
    }
}
