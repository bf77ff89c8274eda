use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, Level};

use xlb::{Client, Cluster, ConfigBuilder, CreateSpec, DataKind, DataValue, DatumId, Event};

const TASK: i32 = 1;
const TASKS: u32 = 16;

// One unit of work: square `n` and file the result under container `results`
#[derive(Debug, Serialize, Deserialize)]
struct Square {
    results: DatumId,
    n: u32,
}

async fn square_worker(mut client: Client) -> Result<u32> {
    let mut done = 0;
    loop {
        let unit = match client.get(TASK).await {
            Ok(unit) => unit,
            Err(e) if e.is_shutdown() => break,
            Err(e) => return Err(e.into()),
        };
        let task: Square = serde_json::from_slice(&unit.payload)?;
        let value = (task.n as i64) * (task.n as i64);
        // each insert gives back one of the writer slots the driver reserved
        client
            .insert(task.results, &task.n.to_string(), value.to_le_bytes().to_vec(), 1)
            .await?;
        done += 1;
    }
    info!("Worker {} squared {} numbers", client.rank(), done);
    client.finalize().await?;
    Ok(done)
}

async fn driver(mut client: Client) -> Result<i64> {
    let results = client
        .create(CreateSpec::container(0, DataKind::Integer).with_refcounts(1, TASKS))
        .await?;
    let watch = client.subscribe(results).await?;

    for n in 0..TASKS {
        let payload = serde_json::to_vec(&Square { results, n })?;
        client.put(payload, TASK, 0, None).await?;
    }
    info!("Submitted {} tasks into container <{}>", TASKS, results);

    let note = client.next_notification().await?;
    if note.token != watch.token || note.event != Event::Closed {
        return Err(anyhow!("unexpected notification {:?}", note));
    }

    let DataValue::Container(entries) = client.retrieve(results).await? else {
        return Err(anyhow!("<{}> is not a container", results));
    };
    let mut sum = 0i64;
    for entry in entries {
        let bytes = entry.member.context("closed container with a reserved entry")?;
        let member = DataValue::from_bytes(DataKind::Integer, &bytes)?;
        if let DataValue::Integer(v) = member {
            sum += v;
        }
    }

    // drain until the run quiesces
    square_worker(client).await?;
    Ok(sum)
}

#[tokio::main]
async fn main() -> Result<()> {
    xlb::logging::init(Level::INFO);

    let config = ConfigBuilder::new()
        .workers(4)
        .servers(2)
        .work_types([TASK])
        .build()?;
    let mut cluster = Cluster::launch(config)?;
    info!("Run {} using xlb {}", cluster.run_id(), xlb::version());

    let mut clients = cluster.clients().into_iter();
    let first = clients.next().context("no workers")?;
    let driver = tokio::spawn(driver(first));
    let workers: Vec<_> = clients.map(|c| tokio::spawn(square_worker(c))).collect();

    let sum = driver.await??;
    for worker in workers {
        worker.await??;
    }
    let stats = cluster.join().await?;

    let expected: i64 = (0..TASKS as i64).map(|n| n * n).sum();
    println!("Sum of squares below {}: {} (expected {})", TASKS, sum, expected);
    for s in &stats {
        println!(
            "server {}: {} puts, {} gets served, {} stolen in, {} vote rounds",
            s.rank, s.puts, s.gets_served, s.stolen_in, s.vote_rounds
        );
    }
    Ok(())
}
