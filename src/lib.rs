pub mod detectors;
pub mod hash;
pub mod image;
pub mod layer_diff;
pub mod matchers;
pub mod merge;
pub mod notifier;
pub mod objects;
pub mod package;
pub mod report;
pub mod sources;
pub mod stats;
pub mod tar_index;

// Re-exports for easy access
pub use image::ExtractedImage;
pub use matchers::{ChangeDataHashMatcher, ChangeDataMatcher, ChangePathMatcher, MatcherSet};
pub use merge::{merge_images, MergeOptions, MergeOutcome};
pub use notifier::Notifier;
pub use package::{load_package, Package, XrayOptions};
pub use sources::{DockerSource, Source, TarSource};
pub use tar_index::TarIndex;
