//! USIG CLI — host a Unique Sequential Identifier Generator
//!
//! Commands:
//!   usig init       — generate or unseal the USIG key, store the sealed key
//!   usig stamp      — assign a unique identifier to a message
//!   usig verify     — verify a unique identifier against a USIG identity
//!   usig export-key — re-seal the key and store it
//!   usig status     — show backend, platform and sealed-key state
//!   usig bench      — concurrent create-identifier throughput
//!   usig demo       — key persistence across restarts, end to end

use futures::future::join_all;
use std::collections::HashSet;
use std::env;
use std::sync::Arc;
use std::time::Instant;
use usig_core::tee::{EnclaveImage, LoaderSession};
use usig_core::usig::{self, IdentifierService, Ui, Usig, UsigEnclave};
use usig_core::{SealedKeyBlob, UsigConfig};

const CONFIG_FILE: &str = "usig.json";

fn print_usage() {
    println!(
        r#"
╔══════════════════════════════════════════════════════════════╗
║        USIG v0.1 — Unique Sequential Identifier Generator    ║
║        Trusted (epoch, counter) stamps for BFT replication   ║
╚══════════════════════════════════════════════════════════════╝

Usage: usig <command> [options]

Commands:
  init       [--fresh]                       Generate or unseal the USIG key
  stamp      <message> [count]               Create unique identifier(s)
  verify     <message> <ui-json> <id-hex>    Verify a unique identifier
  export-key                                 Re-seal the key to disk
  status                                     Show TEE and key status
  bench      [callers] [per-caller]          Concurrent stamping benchmark
  demo                                       Run the restart demo

Configuration is read from ./{} (or $USIG_CONFIG).

Examples:
  usig init
  usig stamp "PREPARE view=1 seq=7"
  usig bench 8 1000
  usig demo
"#,
        CONFIG_FILE
    );
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        return;
    }

    let config_path = env::var("USIG_CONFIG").unwrap_or_else(|_| CONFIG_FILE.to_string());
    let config = match UsigConfig::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("  Failed to load {}: {}", config_path, e);
            std::process::exit(1);
        }
    };

    let result = match args[1].as_str() {
        "init" => cmd_init(&config, &args[2..]),
        "stamp" => cmd_stamp(&config, &args[2..]),
        "verify" => cmd_verify(&args[2..]),
        "export-key" => cmd_export_key(&config),
        "status" => cmd_status(&config),
        "bench" => cmd_bench(&config, &args[2..]).await,
        "demo" => cmd_demo(),
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {}", other);
            print_usage();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("  Error: {}", e);
        std::process::exit(1);
    }
}

type CmdResult = Result<(), Box<dyn std::error::Error>>;

/// Bring up a USIG, reusing the stored sealed key unless `fresh`
fn open_usig(
    config: &UsigConfig,
    fresh: bool,
) -> Result<(Arc<IdentifierService>, Usig), Box<dyn std::error::Error>> {
    let service = Arc::new(IdentifierService::new(config.open_session()?));
    let image = config.enclave_image()?;
    let sealed = if fresh { None } else { config.read_sealed_key()? };

    let usig = Usig::new(Arc::clone(&service), &image, sealed.as_ref())?;
    if sealed.is_none() {
        config.write_sealed_key(&usig.export_sealed_key()?)?;
        println!("  Generated new USIG key");
    } else {
        println!("  Unsealed USIG key from {}", config.sealed_key_path.display());
    }
    Ok((service, usig))
}

fn cmd_init(config: &UsigConfig, args: &[String]) -> CmdResult {
    let fresh = args.iter().any(|a| a == "--fresh");
    let (service, usig) = open_usig(config, fresh)?;
    let status = service.status(usig.handle())?;

    println!("\n  USIG Instance");
    println!("  {}", "=".repeat(40));
    println!("  Handle:          {}", usig.handle());
    println!("  Enclave ID:      {}", &status.enclave_id[..8]);
    println!("  Backend:         {}", status.backend.name());
    println!("  Security Level:  {:?}", status.security_level);
    println!("  MRENCLAVE:       {}...", &status.mrenclave[..16]);
    println!("  Epoch:           {:016x}", usig.epoch()?);
    println!(
        "  Public Key:      {}",
        hex::encode(usig.public_key()?.to_encoded_point(true).as_bytes())
    );
    println!("  USIG ID:         {}", hex::encode(usig.id()?));
    Ok(())
}

fn cmd_stamp(config: &UsigConfig, args: &[String]) -> CmdResult {
    let message = match args.first() {
        Some(m) => m,
        None => {
            eprintln!("Usage: usig stamp <message> [count]");
            return Ok(());
        }
    };
    let count: usize = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(1);

    let (_service, usig) = open_usig(config, false)?;
    println!("  USIG ID: {}", hex::encode(usig.id()?));
    for _ in 0..count {
        let ui = usig.create_ui(message.as_bytes())?;
        println!("  {}", serde_json::to_string(&ui)?);
    }
    Ok(())
}

fn cmd_verify(args: &[String]) -> CmdResult {
    if args.len() < 3 {
        eprintln!("Usage: usig verify <message> <ui-json> <id-hex>");
        return Ok(());
    }
    let ui: Ui = serde_json::from_str(&args[1])?;
    let id = hex::decode(&args[2])?;

    match usig::verify_ui(args[0].as_bytes(), &ui, &id) {
        Ok(()) => println!("  VALID: counter {} verified", ui.counter),
        Err(e) => println!("  INVALID: {}", e),
    }
    Ok(())
}

fn cmd_export_key(config: &UsigConfig) -> CmdResult {
    let (_service, usig) = open_usig(config, false)?;
    let blob = usig.export_sealed_key()?;
    config.write_sealed_key(&blob)?;
    println!(
        "  Sealed key: {} bytes -> {}",
        blob.len(),
        config.sealed_key_path.display()
    );
    Ok(())
}

fn cmd_status(config: &UsigConfig) -> CmdResult {
    let session = config.open_session()?;
    let image = config.enclave_image()?;

    println!("\n  USIG Status");
    println!("  {}", "=".repeat(40));
    println!("  Backend:         {}", session.backend().name());
    println!("  Hardware TEE:    {}", session.backend().is_hardware());
    println!("  Security Level:  {:?}", session.security_level());
    println!("  Platform:        {}", session.trust_root().fingerprint());
    println!("  Enclave Image:   {}", image.name());
    println!("  MRENCLAVE:       {}...", &image.measurement().mrenclave[..16]);
    match config.read_sealed_key()? {
        Some(blob) => println!(
            "  Sealed Key:      {} bytes at {}",
            blob.len(),
            config.sealed_key_path.display()
        ),
        None => println!("  Sealed Key:      none (run 'usig init')"),
    }
    Ok(())
}

async fn cmd_bench(config: &UsigConfig, args: &[String]) -> CmdResult {
    let callers: usize = args.first().and_then(|s| s.parse().ok()).unwrap_or(4);
    let per_caller: usize = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(500);

    let service = Arc::new(IdentifierService::new(config.open_session()?));
    let handle = service.initialize(&config.enclave_image()?, None)?;
    let epoch = service.get_epoch(handle)?;
    let public = service.get_public_key(handle)?;

    println!(
        "\n  Stamping {} identifiers from {} concurrent callers...",
        callers * per_caller,
        callers
    );
    let started = Instant::now();

    let tasks = (0..callers).map(|caller| {
        let service = Arc::clone(&service);
        tokio::task::spawn_blocking(move || {
            let mut issued = Vec::with_capacity(per_caller);
            for i in 0..per_caller {
                let digest = usig::message_digest(format!("{}:{}", caller, i).as_bytes());
                let (counter, signature) = service.create_identifier(handle, &digest)?;
                issued.push((digest, counter, signature));
            }
            Ok::<_, usig_core::UsigError>(issued)
        })
    });

    let mut counters = HashSet::new();
    let mut verified = 0usize;
    for joined in join_all(tasks).await {
        for (digest, counter, signature) in joined?? {
            if usig::verify(&public, &digest, epoch, counter, &signature) {
                verified += 1;
            }
            counters.insert(counter);
        }
    }
    let elapsed = started.elapsed();

    let total = (callers * per_caller) as u64;
    let gapless = counters.len() as u64 == total && (1..=total).all(|c| counters.contains(&c));

    println!("  Elapsed:         {:.2?}", elapsed);
    println!(
        "  Throughput:      {:.0} ids/s",
        total as f64 / elapsed.as_secs_f64().max(f64::EPSILON)
    );
    println!("  Verified:        {}/{}", verified, total);
    println!("  Gapless:         {}", gapless);

    service.destroy(handle)?;
    Ok(())
}

fn cmd_demo() -> CmdResult {
    println!("\n  USIG demo: key persistence with epoch/counter reset");
    println!("  {}", "=".repeat(52));

    // One platform for the whole demo, so the sealed key stays valid.
    let service = Arc::new(IdentifierService::new(LoaderSession::simulated()));
    let image = EnclaveImage::builtin();

    let (sealed, e1, id1): (SealedKeyBlob, u64, Vec<u8>) = {
        let usig = Usig::new(Arc::clone(&service), &image, None)?;
        let e1 = usig.epoch()?;
        println!("\n  [1] Fresh instance: epoch E1={:016x}", e1);

        let a = usig.create_ui(b"request A")?;
        let b = usig.create_ui(b"request B")?;
        println!("      UI(request A) counter={}", a.counter);
        println!("      UI(request B) counter={}", b.counter);

        let id1 = usig.id()?;
        println!(
            "      verify(A): {}",
            usig::verify_ui(b"request A", &a, &id1).is_ok()
        );

        let sealed = usig.export_sealed_key()?;
        println!("      Exported sealed key: {} bytes", sealed.len());
        (sealed, e1, id1)
    };
    println!("  [2] Instance destroyed (live contexts: {})", service.session().live_contexts());

    let usig = Usig::new(Arc::clone(&service), &image, Some(&sealed))?;
    let e2 = usig.epoch()?;
    let id2 = usig.id()?;
    let same_key = id1[8..] == id2[8..];
    println!("\n  [3] Restored instance: epoch E2={:016x}", e2);
    println!("      Same public key: {}", same_key);
    println!("      New epoch:       {}", e1 != e2);

    let a2 = usig.create_ui(b"request A")?;
    println!("      UI(request A) counter={} (fresh stream)", a2.counter);
    println!(
        "      verify under E2 id: {}",
        usig::verify_ui(b"request A", &a2, &id2).is_ok()
    );
    match usig::verify_ui(b"request A", &a2, &id1) {
        Ok(()) => println!("      verify under E1 id: accepted (unexpected)"),
        Err(e) => println!("      verify under E1 id: rejected ({})", e),
    }

    let foreign = IdentifierService::new(LoaderSession::simulated());
    match foreign.initialize(&image, Some(&sealed)) {
        Ok(_) => println!("\n  [4] Foreign platform unsealed the key (unexpected)"),
        Err(e) => println!("\n  [4] Foreign platform: {}", e),
    }

    println!("\n  Demo complete.");
    Ok(())
}
