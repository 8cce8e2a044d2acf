use playstyle::{GameTagMap, Pipeline, PipelineConfig, Recommendation, UserLibraries, UserLibrary};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing_subscriber::EnvFilter;

/// Three playstyles, each with its own tag pool.
const STYLES: [(&str, [&str; 6]); 3] = [
    (
        "tactics",
        ["Turn-Based", "Tactical", "Deckbuilder", "Roguelike", "Card Game", "Grid-Based"],
    ),
    (
        "survival",
        ["Survival", "Crafting", "Base Building", "Sandbox", "Exploration", "Co-op"],
    ),
    (
        "racing",
        ["Racing", "Driving", "Arcade", "Sports", "Split Screen", "Motorsport"],
    ),
];

const GAMES_PER_STYLE: usize = 8;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Set RUST_LOG=debug for per-stage detail.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Game `style_j` carries three consecutive tags from its style's pool.
    let catalog = GameTagMap::new(STYLES.iter().flat_map(|(style, pool)| {
        (0..GAMES_PER_STYLE).map(move |j| {
            let tags: Vec<&str> = (0..3).map(|t| pool[(j + t) % pool.len()]).collect();
            (format!("{style}_{j}"), tags)
        })
    }))?;

    let mut rng = StdRng::seed_from_u64(2024);
    let mut libraries = Vec::new();
    let mut truth = Vec::new();
    for u in 0..150 {
        let style = u % STYLES.len();
        let (name, _) = STYLES[style];
        // Each user skips a couple of their style's games.
        let mut games: Vec<(String, u64)> = Vec::new();
        for j in 0..GAMES_PER_STYLE {
            if j == u % GAMES_PER_STYLE || rng.random_bool(0.8) {
                games.push((format!("{name}_{j}"), rng.random_range(60..3000)));
            }
        }
        libraries.push(UserLibrary::new(format!("player{u:03}"), games));
        truth.push(style);
    }
    let libraries = UserLibraries::new(libraries)?;

    // PLAYSTYLE_* variables override the defaults.
    let config = PipelineConfig::from_env()?;
    let pipeline = Pipeline::new(config);
    let run = pipeline.train(&catalog, &libraries)?;

    println!(
        "users={} tags={} eps={:.3} clusters={} noise={}",
        run.features.n_users(),
        run.features.n_tags(),
        run.assignment.eps,
        run.assignment.n_clusters(),
        run.assignment.n_noise()
    );
    for (id, signature) in run.merged.signature_table() {
        println!("  cluster {id}: {signature} ({} members)", run.merged.members[id].len());
    }
    println!(
        "classifier: k={} cv_accuracy={:?}",
        run.classifier.k(),
        run.classifier.cv_accuracy()
    );

    let scores = pipeline.evaluate(&run, &truth)?;
    println!(
        "ari={:.3} nmi={:.3} agreement={:.3}",
        scores.ari, scores.nmi, scores.agreement
    );

    let newcomer = UserLibrary::new(
        "newcomer",
        [("survival_0", 1200), ("survival_1", 800), ("survival_2", 300)],
    );
    let cluster = pipeline.classify(&catalog, &run.classifier, &newcomer)?;
    println!("newcomer routed to cluster {cluster}");
    match pipeline.recommend(&catalog, &newcomer, &run.merged, &libraries)? {
        Recommendation::Matched { affinities, games } => {
            for a in &affinities {
                println!("  affinity cluster {}: {:.2}", a.cluster, a.affinity);
            }
            println!("  recommended: {}", games.join(", "));
        }
        Recommendation::NoConfidentMatch => println!("  no confident match"),
    }

    Ok(())
}
