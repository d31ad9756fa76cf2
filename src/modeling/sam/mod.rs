pub mod prompt_encoder;
pub mod prompts;
