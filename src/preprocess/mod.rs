pub mod clahe;
pub mod corpus;
pub mod filters;
pub mod normalizer;

pub use clahe::Clahe;
pub use corpus::{collect_images, is_image_file, normalize_corpus, CorpusReport};
pub use normalizer::ImageNormalizer;
