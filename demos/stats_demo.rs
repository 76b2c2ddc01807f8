use clap::Parser;
use elastic_store::HashIndex;

#[derive(Parser, Debug)]
struct Args {
    /// Number of keys to insert.
    #[arg(short = 'n', long = "keys", default_value_t = 1000)]
    keys: u64,

    /// Fraction of the inserted keys to delete afterwards.
    #[arg(short = 'd', long = "delete_ratio", default_value_t = 0.5)]
    delete_ratio: f64,

    /// Fixed salt seed for a reproducible layout.
    #[arg(short = 's', long = "seed")]
    seed: Option<u64>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let index: HashIndex<u64, u64> = match args.seed {
        Some(seed) => HashIndex::with_seed_and_hasher(seed, Default::default())?,
        None => HashIndex::new()?,
    };

    println!("Initial capacity: {}", index.capacity());
    println!("Inserting {} keys...", args.keys);
    for key in 0..args.keys {
        index.insert(key, key.wrapping_mul(31))?;
    }

    println!("Inserted {} keys into index", index.len());
    index.print_probe_histogram()?;
    index.debug_stats()?.print();

    let deletions = (args.keys as f64 * args.delete_ratio.clamp(0.0, 1.0)) as u64;
    println!("Deleting {} keys...", deletions);
    for key in 0..deletions {
        index.delete(&key)?;
    }

    index.print_probe_histogram()?;
    index.debug_stats()?.print();
    println!("Consistent: {}", index.check()?);

    Ok(())
}
