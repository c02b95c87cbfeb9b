// cargo run --example redistribute_three_workers
use mesh_redistribute::algs::reduction::{parallel_histogram, reduce};
use mesh_redistribute::prelude::*;

fn main() {
    let world = RayonComm::world(3);
    std::thread::scope(|s| {
        for comm in world {
            s.spawn(move || run_worker(comm));
        }
    });
}

fn run_worker(comm: RayonComm) {
    let group = WorkerGroup::new(comm).unwrap();
    let w = group.worker();

    // everything starts on rank 0: ten unit items in two regions
    let items: Vec<WorkItem<u64>> = if w.rank() == 0 {
        (0..10)
            .map(|i| WorkItem::new(0, i, 1.0, 100 + i).with_region(i / 5))
            .collect()
    } else {
        Vec::new()
    };

    let report = Redistributor::from_config(w.config()).run(&w, items).unwrap();
    println!(
        "rank {}: pass {} kept {} items, sent {:?}, regions {:?}",
        w.rank(),
        report.pass,
        report.items.len(),
        report.summary.destinations,
        report
            .items
            .iter()
            .map(|it| it.global_region.get())
            .collect::<Vec<_>>()
    );

    let pass = w.begin_pass().unwrap();
    let totals = reduce(
        &w,
        &pass,
        RegionTotals::from_items(&report.items),
        0,
        w.config().reduce_topology,
    )
    .unwrap();
    let weights: Vec<f64> = report.items.iter().map(|it| it.weight).collect();
    let hist = parallel_histogram(&w, &pass, weights.as_slice(), 4, 0).unwrap();
    pass.finish();

    if let (Some(totals), Some(hist)) = (totals, hist) {
        println!("loads after pass: {:?}", report.balance.loads);
        println!("region totals: {:?}", totals.0);
        println!("weight histogram: {:?} over {:?}", hist.counts(), hist.range());
    }
}
