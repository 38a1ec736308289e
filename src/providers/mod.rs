pub mod ollama;

pub use ollama::OllamaModel;
