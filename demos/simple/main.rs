use splitkit::{Attributes, Experiment, ExperimentResult, RefreshStrategy};

pub fn main() -> splitkit::Result<()> {
    // Configure env_logger to see client logs.
    env_logger::Builder::from_env(env_logger::Env::new().default_filter_or("splitkit")).init();

    let client_key = std::env::var("SPLITKIT_CLIENT_KEY")
        .expect("SPLITKIT_CLIENT_KEY env variable should contain client key");
    let client = splitkit::ClientConfig::from_client_key(client_key)
        .tracking_callback(|experiment: &Experiment, result: &ExperimentResult| {
            println!(
                "Experiment viewed: {} -> variation {}",
                experiment.key, result.key
            );
        })
        .refresh_strategy(RefreshStrategy::Streaming)
        .to_client();

    // Start a refresh thread to keep features up to date.
    let refresh = client.start_refresh()?;

    // Block waiting for features. Until this call returns, every feature is unknown.
    if let Err(err) = refresh.wait_for_configuration() {
        println!("error loading features: {:?}", err);
    }

    let attributes: Attributes = serde_json::from_value(serde_json::json!({
        "id": "test-user",
        "country": "US",
    }))?;

    let result = client.eval_feature("a-boolean-feature", &attributes);
    println!("{}", serde_json::to_string_pretty(&result)?);

    refresh.shutdown()
}
