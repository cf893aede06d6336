pub mod case_repo;
pub mod gpu_repo;

pub use case_repo::{CaseRepository, SqliteCaseRepository};
pub use gpu_repo::GpuRepository;
