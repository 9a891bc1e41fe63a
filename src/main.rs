//! Wirenet headless driver
//!
//! Builds the demo level, wires it the way a player would, launches and runs
//! the fixed-step loop until the level is decided. Progress is kept in a JSON
//! profile (first argument, default `wirenet_profile.json`).

use std::path::PathBuf;

use wirenet::consts::{MAX_SUBSTEPS, SIM_DT};
use wirenet::sim::{GameEvent, PortRef, SystemId, World};
use wirenet::{LevelConfig, PlayerProfile, ProgressStore, Tuning};

const DEMO_LEVEL: &str = r#"{
    "name": "demo",
    "systems": [
        { "id": 1, "kind": "terminal", "position": [0.0, 100.0],
          "outputs": ["square"],
          "packets": [
            { "kind": "simple", "count": 3 },
            { "kind": "aggregate", "size": 3, "color": 1, "motion": "decorated" }
          ] },
        { "id": 2, "kind": "encryptor", "position": [200.0, 100.0],
          "inputs": ["square"], "outputs": ["triangle"] },
        { "id": 3, "kind": "merger", "position": [400.0, 100.0],
          "inputs": ["triangle"], "outputs": ["square"] },
        { "id": 4, "kind": "terminal", "position": [600.0, 100.0],
          "inputs": ["square"] }
    ]
}"#;

/// Host frame length fed to the accumulator (a slightly slow display)
const FRAME_DT: f32 = 1.0 / 55.0;
/// Give up after this much simulated time
const TIME_LIMIT: f64 = 300.0;

#[cfg(not(target_arch = "wasm32"))]
fn main() {
    env_logger::init();
    log::info!("Wirenet (native) starting...");

    let profile_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("wirenet_profile.json"));
    let mut profile = PlayerProfile::load_or_default(&profile_path);

    let level = match LevelConfig::from_json(DEMO_LEVEL) {
        Ok(level) => level,
        Err(e) => {
            log::error!("Demo level is broken: {e}");
            std::process::exit(1);
        }
    };
    let mut world = match World::from_level(&level, 0x5eed, Tuning::default()) {
        Ok(world) => world,
        Err(e) => {
            log::error!("Could not build level: {e}");
            std::process::exit(1);
        }
    };

    for (from, to) in [(1, 2), (2, 3), (3, 4)] {
        if let Err(e) = world.add_line(
            PortRef::output(SystemId(from), 0),
            PortRef::input(SystemId(to), 0),
        ) {
            log::error!("Wiring {from} -> {to} failed: {e}");
            std::process::exit(1);
        }
    }
    log::info!(
        "Level '{}' (passed before: {}, wallet: {})",
        world.level,
        profile.is_level_passed(&world.level),
        profile.total_coins()
    );

    world.launch();
    let mut accumulator = 0.0;
    while world.outcome().is_none() && world.time < TIME_LIMIT {
        accumulator += FRAME_DT;
        let mut substeps = 0;
        while accumulator >= SIM_DT && substeps < MAX_SUBSTEPS {
            world.update(&mut profile, SIM_DT);
            accumulator -= SIM_DT;
            substeps += 1;
        }

        for event in world.drain_events() {
            match event {
                GameEvent::Delivered { packet, coins } => {
                    log::info!("{packet:?} delivered (+{coins})")
                }
                GameEvent::PacketLost { packet } => log::info!("{packet:?} lost"),
                GameEvent::SystemDestroyed { system } => log::info!("{system:?} destroyed"),
                GameEvent::Merged { packet, size } => {
                    log::info!("Aggregate {packet:?} of size {size} rebuilt")
                }
                GameEvent::Won { coins } => log::info!("Won with {coins} coins"),
                GameEvent::Lost => log::info!("Lost"),
            }
        }
    }

    match world.outcome() {
        Some(outcome) => log::info!(
            "{outcome:?} after {:.1}s: {}/{} delivered, {} coins",
            world.time,
            world.delivered,
            world.spawned,
            world.coins
        ),
        None => log::warn!("No outcome after {TIME_LIMIT}s, {} packets left", world.packets.len()),
    }

    if let Err(e) = profile.save(&profile_path) {
        log::warn!("Could not save profile: {e}");
    }
}

#[cfg(target_arch = "wasm32")]
fn main() {
    // No headless driver on the web
}
