use anyhow::{Context, Result};
use futures::executor::block_on;
use tracing_subscriber::EnvFilter;

use blockcache::policy;
use blockcache::storage::disk::FileDisk;
use blockcache::{Cache, CacheConfig};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // config
    let mut args = std::env::args().skip(1);
    let path = args.next().unwrap_or_else(|| "sample.blk".to_string());
    let config = match args.next() {
        Some(config_path) => {
            let json = std::fs::read_to_string(&config_path)
                .with_context(|| format!("reading {}", config_path))?;
            CacheConfig::from_json(&json)?
        }
        None => CacheConfig::default(),
    };

    let disk = FileDisk::open(&path, config.block_size)
        .with_context(|| format!("opening {}", path))?;
    let policy = policy::build(config.policy);
    let cache = Cache::new(config, disk, policy)?;

    // create a couple of blocks
    let mut tx = cache.begin_transaction();
    let mut created = vec![];
    for greeting in [&b"hello"[..], &b"world"[..]] {
        let (block_id, buffer) = tx.allocate()?;
        buffer.write()[..greeting.len()].copy_from_slice(greeting);
        created.push(block_id);
    }
    tx.commit()?;
    let issued = cache.flush_committed();
    println!("allocated {:?}, {} write-backs issued", created, issued);

    // wait until the writes are durable, then drop the buffers and read them back
    block_on(cache.drain())?;
    while cache.evict().is_some() {}

    let mut tx = cache.begin_transaction();
    block_on(cache.run(async {
        for &block_id in &created {
            let buffer = tx.get(block_id).await?;
            let bytes = buffer.read();
            println!("{}: {:?}", block_id, String::from_utf8_lossy(&bytes[..5]));
        }
        Ok::<_, blockcache::Error>(())
    }))?;
    tx.commit()?;

    println!("{:?}", cache.stats());
    Ok(())
}
