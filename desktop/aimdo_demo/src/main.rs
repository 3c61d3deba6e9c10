use aimdo::{
    modules::{driver::SimulatedDriverModule, platform_budget::NoPlatformBudgetModule},
    Aimdo, AimdoConfig, VbarHandle,
};
use env_logger::{Builder, Env};
use rand::{rngs::SmallRng, Rng, SeedableRng};

const M: u64 = 1024 * 1024;

/// Streams the weights of a model that does not fit into VRAM through a
/// simulated device, while the framework allocates activations next to it.
fn main() {
    Builder::from_env(Env::default())
        .filter_level(log::LevelFilter::Info)
        .format_module_path(false)
        .init();

    let capacity = 2048 * M;
    let mut aimdo = Aimdo::new(
        SimulatedDriverModule::new(capacity),
        NoPlatformBudgetModule,
        0,
        AimdoConfig::default(),
    )
    .unwrap();
    let page_size = aimdo.config().vbar_page_size;

    // four layers of 768 MB each
    let layers: Vec<VbarHandle> = (0..4)
        .map(|_| aimdo.allocate_vbar(768 * M, 0).unwrap())
        .collect();

    let mut rng = SmallRng::seed_from_u64(42);

    for step in 0..3 {
        for (i, layer) in layers.iter().enumerate() {
            aimdo.prioritize(*layer).unwrap();

            let mut reloaded = 0;
            let mut offset = 0;
            while offset < 768 * M {
                match aimdo.fault(*layer, offset, page_size) {
                    Ok(serials) => {
                        reloaded += serials.iter().filter(|serial| **serial > 1).count();
                    }
                    Err(err) => {
                        println!("layer {}: fault at {} MB failed: {}", i, offset / M, err);
                        break;
                    }
                }
                offset += page_size;
            }

            // activations of the layer
            let activations: Vec<_> = (0..4)
                .filter_map(|_| aimdo.alloc(rng.gen_range(M..64 * M), 0).ok())
                .collect();

            aimdo.unpin(*layer, 0, 768 * M).unwrap();
            for ptr in activations {
                aimdo.free(ptr);
            }

            println!(
                "step {} layer {}: {:>4} MB resident ({} pages reloaded), total usage {:>4} MB",
                step,
                i,
                aimdo.loaded_size(*layer).unwrap() / M,
                reloaded,
                aimdo.total_vram_usage() / M
            );
        }
    }

    let stats = aimdo.stats();
    println!(
        "recorded usage: {} MB, driver free: {} MB of {} MB",
        stats.recorded_usage / M,
        stats.driver_free.unwrap_or(0) / M,
        stats.driver_total.unwrap_or(0) / M
    );

    if let Some(report) = aimdo.analyze() {
        for vbar in &report.vbars {
            println!(
                "VBAR {:#x}: {}/{} pages resident, watermark {}",
                vbar.base, vbar.counted_resident, vbar.nr_pages, vbar.watermark
            );
        }
        assert!(report.is_consistent());
    }

    for layer in layers {
        aimdo.free_vbar(layer).unwrap();
    }
}
