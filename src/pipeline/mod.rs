pub mod chunker;
pub mod instructions;
pub mod length;
pub mod reconstruct;
pub mod skeleton;
pub mod stitch;
pub mod text;
pub mod validate;

pub use chunker::{smart_chunk, TextChunk};
pub use length::{calculate_length_config, parse_target_length, LengthConfig, LengthMode};
pub use reconstruct::{
    reconstruct_chunk, ChunkBand, ChunkDelta, ChunkInput, Guidance, ReconstructSettings,
};
pub use skeleton::{extract_skeleton, GlobalSkeleton, SkeletonSettings};
pub use stitch::{
    generate_requested_additions, stitch_and_validate, AnalysisSettings, StitchChunk,
    StitchResult,
};
pub use validate::{validate_final_output, FinalValidation};
