//! Headless driver for the virtual scene cache.
//!
//! Moves a camera along +X through a flat chunk layer, keeps the near and far
//! fields populated, and feeds synthetic GPU feedback through the cache with
//! the real one-frame latency: work emitted in frame N completes in frame N+1.
//!
//! Run with `cargo run -p nebula-cache-demo -- --frames 600 --near-radius 4`.

use clap::Parser;
use nebula_config::{CliArgs, Config};
use nebula_scene_cache::{
    AtlasBackend, ChunkCoord, FaceDirection, Field, PageRequest, PatchGeometry, PatchKey,
    PatchMetadata, PhysicalPoolPlan, VirtualSceneCache, WorkQueues,
};
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256StarStar;
use rustc_hash::FxHashSet;
use tracing::{info, warn};

/// Chunk edge length in voxels.
const CHUNK_SIZE: f32 = 32.0;

/// Frames the camera spends in each chunk.
const FRAMES_PER_CHUNK: u32 = 8;

#[derive(Parser, Debug)]
#[command(name = "nebula-cache-demo", about = "Headless scene cache frame loop")]
struct DemoArgs {
    #[command(flatten)]
    cli: CliArgs,

    /// Frames to simulate.
    #[arg(long, default_value_t = 240)]
    frames: u32,

    /// Feedback requests generated per field per frame.
    #[arg(long, default_value_t = 2048)]
    requests: u32,

    /// RNG seed for the synthetic feedback.
    #[arg(long, default_value_t = 42)]
    seed: u64,
}

/// Stands in for the renderer's atlas allocation.
struct LoggingBackend;

impl AtlasBackend for LoggingBackend {
    fn create_atlases(&mut self, field: Field, plan: &PhysicalPoolPlan) {
        info!(
            ?field,
            atlases = plan.atlas_count,
            atlas_size = plan.atlas_size,
            tile_size = plan.tile_size,
            "create atlases"
        );
    }

    fn destroy_atlases(&mut self, field: Field) {
        info!(?field, "destroy atlases");
    }
}

/// Upload counts the cache does not track itself.
#[derive(Default)]
struct Totals {
    table_writes: [usize; 2],
    completed: [usize; 2],
    metadata_records: usize,
}

struct Demo {
    cache: VirtualSceneCache,
    rng: Xoshiro256StarStar,
    camera: ChunkCoord,
    /// Chunks whose patches were registered this residency.
    meshed: FxHashSet<ChunkCoord>,
    /// Last frame's work, completed one frame late.
    in_flight: [WorkQueues; 2],
    /// Patch metadata built this frame, standing in for the upload buffer.
    metadata: Vec<PatchMetadata>,
    requests_per_field: u32,
    log_frame_stats: bool,
    totals: Totals,
}

impl Demo {
    fn new(cache: VirtualSceneCache, args: &DemoArgs, log_frame_stats: bool) -> Self {
        Self {
            cache,
            rng: Xoshiro256StarStar::seed_from_u64(args.seed),
            camera: ChunkCoord::default(),
            meshed: FxHashSet::default(),
            in_flight: Default::default(),
            metadata: Vec::new(),
            requests_per_field: args.requests,
            log_frame_stats,
            totals: Totals::default(),
        }
    }

    fn frame(&mut self, frame: u32) {
        self.camera.x = (frame / FRAMES_PER_CHUNK) as i32;
        self.complete_in_flight();
        self.update_residency();
        self.totals.metadata_records += self.metadata.len();
        self.metadata.clear();
        for field in Field::ALL {
            let requests = self.synthesize_requests(field);
            let mut work = WorkQueues::default();
            let outcome = self.cache.process_feedback(field, &requests, &mut work);
            self.totals.table_writes[field.index()] += self.cache.take_page_table_writes(field).len();
            if self.log_frame_stats {
                info!(
                    frame,
                    ?field,
                    allocated = outcome.allocated,
                    evicted = outcome.evicted,
                    deferred = outcome.deferred,
                    capture = outcome.capture_count,
                    relight = outcome.relight_count,
                    "frame feedback"
                );
            }
            self.in_flight[field.index()] = work;
        }
    }

    /// Completes the work emitted last frame.
    fn complete_in_flight(&mut self) {
        for field in Field::ALL {
            let work = std::mem::take(&mut self.in_flight[field.index()]);
            let done = self.cache.complete_capture(field, &work.capture)
                + self.cache.complete_relight(field, &work.relight);
            self.totals.completed[field.index()] += done;
        }
    }

    /// Activates every chunk within the far radius and unloads the rest.
    fn update_residency(&mut self) {
        let far = self.cache.config().far.radius_chunks as i32;
        for dz in -far..=far {
            for dx in -far..=far {
                let chunk = ChunkCoord::new(self.camera.x + dx, 0, self.camera.z + dz);
                let Some(field) = self.cache.field_for(self.camera, chunk) else {
                    continue;
                };
                if self.cache.activate_chunk(field, chunk).is_none() {
                    warn!(?field, ?chunk, "chunk activation failed");
                    continue;
                }
                if self.meshed.insert(chunk) {
                    self.mesh_chunk(chunk);
                }
            }
        }

        let behind: Vec<ChunkCoord> = self
            .meshed
            .iter()
            .copied()
            .filter(|&chunk| self.cache.field_for(self.camera, chunk).is_none())
            .collect();
        for chunk in behind {
            self.cache.unload_chunk(chunk);
            self.meshed.remove(&chunk);
        }

        for released in self.cache.take_released_pages() {
            // The chunk slot changed, so its patch metadata must be rebuilt.
            self.meshed.remove(&released.chunk);
        }
    }

    /// Registers the chunk's patches and builds their GPU metadata.
    fn mesh_chunk(&mut self, chunk: ChunkCoord) {
        self.cache.begin_remesh(chunk);
        let origin = glam::Vec3::new(chunk.x as f32, chunk.y as f32, chunk.z as f32) * CHUNK_SIZE;
        let mut keys: Vec<PatchKey> = FaceDirection::ALL
            .iter()
            .map(|&face| PatchKey::voxel_face(face, 0, 0, 0))
            .collect();
        keys.push(PatchKey::mesh_card(chunk_instance_id(chunk), 0));

        for key in keys {
            let Ok((id, _)) = self.cache.register_patch(chunk, key) else {
                warn!(?chunk, "patch registry full");
                break;
            };
            let normal = match key {
                PatchKey::VoxelFace { face, .. } => face.normal(),
                PatchKey::MeshCard { .. } => glam::Vec3::Y,
            };
            let geometry = PatchGeometry {
                origin,
                u_axis: glam::Vec3::X * CHUNK_SIZE,
                v_axis: glam::Vec3::Z * CHUNK_SIZE,
                normal,
                flags: u32::from(key.is_mesh_card()),
            };
            if let Some(record) = self.cache.patch_metadata(chunk, id, &geometry) {
                self.metadata.push(record);
            }
        }
    }

    /// Random requests over the field's resident chunks and their patches.
    fn synthesize_requests(&mut self, field: Field) -> Vec<PageRequest> {
        let slots: Vec<(ChunkCoord, u32)> = self
            .cache
            .residency()
            .resident_chunks(field)
            .map(|(chunk, page)| (chunk, page.slot()))
            .collect();
        if slots.is_empty() {
            return Vec::new();
        }
        (0..self.requests_per_field)
            .filter_map(|_| {
                let (chunk, slot) = slots[self.rng.gen_range(0..slots.len())];
                let patches = self.cache.registry(chunk)?.len();
                if patches == 0 {
                    return None;
                }
                let patch = self.rng.gen_range(0..patches) as u32;
                Some(PageRequest::new(slot, patch))
            })
            .collect()
    }

    fn summarize(&self) {
        for field in Field::ALL {
            let feedback = self.cache.processor(field).stats();
            let residency = self.cache.residency().stats(field);
            info!(
                ?field,
                examined = feedback.examined,
                allocated = feedback.allocated,
                evicted = feedback.evicted,
                deferred = feedback.deferred,
                captured = feedback.captured,
                relit = feedback.relit,
                recaptured = feedback.recaptured,
                stale = feedback.stale_completions,
                completed = self.totals.completed[field.index()],
                table_writes = self.totals.table_writes[field.index()],
                resident_chunks = self.cache.residency().resident_count(field),
                chunk_evictions = residency.evictions,
                mapped_pages = self.cache.processor(field).mapped_count(),
                "field summary"
            );
        }
        info!(records = self.totals.metadata_records, "patch metadata built");
    }
}

fn chunk_instance_id(chunk: ChunkCoord) -> u64 {
    let x = u64::from(chunk.x as u32);
    let z = u64::from(chunk.z as u32);
    (x << 32) | z
}

fn main() {
    let args = DemoArgs::parse();

    // Resolve config directory
    let config_dir = match args.cli.config.clone().map_or_else(Config::default_dir, Ok) {
        Ok(dir) => dir,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    // Load or create config, then apply CLI overrides
    let mut config = Config::load_or_create(&config_dir).unwrap_or_else(|e| {
        eprintln!("Failed to load config: {e}, using defaults");
        Config::default()
    });
    config.apply_cli_overrides(&args.cli);

    let log_dir = config_dir.join("logs");
    nebula_log::init_logging(Some(&log_dir), cfg!(debug_assertions), Some(&config));

    config.scene_cache.sanitize();
    let mut cache = match VirtualSceneCache::from_config(&config.scene_cache) {
        Ok(cache) => cache,
        Err(e) => {
            tracing::error!("Failed to plan scene cache: {e}");
            std::process::exit(1);
        }
    };
    let mut backend = LoggingBackend;
    cache.ensure_resources(&mut backend);

    let mut demo = Demo::new(cache, &args, config.debug.log_frame_stats);
    for frame in 0..args.frames {
        demo.frame(frame);
    }
    demo.summarize();
    demo.cache.release_resources(&mut backend);
}
