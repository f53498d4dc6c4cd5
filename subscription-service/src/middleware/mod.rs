pub mod project;

pub use project::ProjectContext;
