use iqx_rs::{extract::Extractor, session::SessionContext};

#[tokio::main]
async fn main() {
    env_logger::init();

    // Read url from args; --playlist resolves every episode on the album
    let mut args = std::env::args().skip(1);
    let mut playlist = false;
    let mut url = None;
    for arg in &mut args {
        if arg == "--playlist" {
            playlist = true;
        } else {
            url = Some(arg);
        }
    }
    let url = url.expect("usage: iqx-rs [--playlist] <page-url>");

    let extractor =
        Extractor::new(SessionContext::default()).expect("could not create extractor");

    if playlist {
        eprintln!("Resolving playlist from {}", url);
        match extractor.extract_playlist(&url, 2).await {
            Ok(result) => {
                let ok = result.episodes.iter().filter(|r| r.success).count();
                eprintln!("{}/{} episodes resolved", ok, result.episodes.len());
                println!(
                    "{}",
                    serde_json::to_string_pretty(&result).expect("report serializes")
                );
            }
            Err(e) => {
                eprintln!("Playlist extraction failed: {}", e);
                std::process::exit(1);
            }
        }
    } else {
        eprintln!("Resolving {}", url);
        let report = extractor.extract_report(&url).await;
        println!(
            "{}",
            serde_json::to_string_pretty(&report).expect("report serializes")
        );
        if !report.success {
            std::process::exit(1);
        }
    }
}
