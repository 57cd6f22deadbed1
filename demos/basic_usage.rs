//! Basic usage example for gemini-control

use gemini_control::{
    ChatMessage, ControlOptions, GeminiBackend, GeminiControl, GenerationConfig, SafetyCategory,
    SafetySetting, SafetyThreshold, DEFAULT_MODEL,
};
use std::io::Write;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::init();

    println!("gemini-control - Basic Usage Example\n");

    // The backend falls back to GEMINI_API_KEY when no key is synced
    let control = GeminiControl::connect(
        ControlOptions {
            model: Some(DEFAULT_MODEL.to_string()),
            system_prompt: Some("You are a helpful assistant.".to_string()),
            generation_config: Some(GenerationConfig {
                temperature: Some(0.7),
                max_output_tokens: Some(512),
                ..Default::default()
            }),
            safety_settings: Some(vec![SafetySetting::new(
                SafetyCategory::Harassment,
                SafetyThreshold::BlockMediumAndAbove,
            )]),
            ..Default::default()
        },
        GeminiBackend::with_defaults()?,
    )
    .await?;

    // Typed edits are synced before the next request
    control
        .update_state(|state| state.set_system_prompt(Some("Answer briefly.".to_string())))
        .await;
    for (name, value) in control.state().await.attributes() {
        println!("  {} = {}", name, value.as_deref().unwrap_or("-"));
    }
    println!();

    control.on_error(|event| {
        eprintln!("[error] {}", event.data);
        Ok(())
    });
    control.on_chunk(|event| {
        if event.is_stream_done() {
            println!("\n[stream finished]");
        } else {
            print!("{}", event.data);
            std::io::stdout().flush()?;
        }
        Ok(())
    });

    println!("Counting tokens...");
    let question = "What are three interesting facts about the Rust programming language?";
    println!("Tokens: {}\n", control.count_tokens(question, None).await?);

    println!("Sending prompt...");
    let answer = control.prompt(question, None).await?;
    println!("Response received:\n{}\n", answer);

    println!("Streaming a chat...");
    let history = vec![
        ChatMessage::user(question),
        ChatMessage::model(answer),
        ChatMessage::user("Now summarize that in one sentence."),
    ];
    println!("{}", control.stream_chat(&history, None).await?);

    // Give the stream a moment before exiting
    tokio::time::sleep(std::time::Duration::from_secs(10)).await;
    println!("Done!");

    Ok(())
}
