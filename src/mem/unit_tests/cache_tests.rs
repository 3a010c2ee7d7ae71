use super::common::{assert_tag_exclusive, load_request, small_cache, test_channel, SinkUnit};
use crate::address::Address;
use crate::mem::cache::CacheConfig;
use crate::mem::operable::Operable;
use crate::mem::request::{AccessKind, MemRequest};
use crate::modules::next_line::NextLine;
use crate::modules::lru::Lru;
use crate::mem::cache::Cache;

#[test]
fn coalesced_misses_send_one_read_below_and_fill_every_waiter() {
    let upper_a = test_channel("lsq_a->uut");
    let upper_b = test_channel("lsq_b->uut");
    let lower = test_channel("uut->below");
    let mut cache = small_cache(
        CacheConfig::default(),
        vec![upper_a.clone(), upper_b.clone()],
        lower.clone(),
    );
    let mut sink = SinkUnit::new(lower.clone(), 5);

    // two loads to the same block within one cycle, from different producers
    {
        let mut a = upper_a.write().unwrap();
        assert!(a.add_rq(load_request(0x4000, 1, &upper_a), 0));
    }
    {
        let mut b = upper_b.write().unwrap();
        assert!(b.add_rq(load_request(0x4020, 2, &upper_b), 0));
    }

    let mut responses_a = Vec::new();
    let mut responses_b = Vec::new();
    for cycle in 0..100 {
        cache.operate(cycle);
        sink.operate(cycle);
        while let Some(resp) = upper_a.write().unwrap().pop_ready_response(cycle) {
            responses_a.push(resp);
        }
        while let Some(resp) = upper_b.write().unwrap().pop_ready_response(cycle) {
            responses_b.push(resp);
        }
    }

    assert_eq!(lower.read().unwrap().stats.rq_enqueued, 1, "the lower level must see one read");
    assert_eq!(responses_a.len(), 1);
    assert_eq!(responses_b.len(), 1);
    assert!(responses_a[0].instr_depend_on_me.contains(&1));
    assert!(responses_a[0].instr_depend_on_me.contains(&2));
    assert_eq!(cache.stats.mshr_merged, 1);
}

#[test]
fn at_most_one_way_holds_a_block() {
    let upper = test_channel("up");
    let lower = test_channel("down");
    let mut cache = small_cache(
        CacheConfig {
            sets: 2,
            ways: 4,
            ..CacheConfig::default()
        },
        vec![upper.clone()],
        lower.clone(),
    );
    let mut sink = SinkUnit::new(lower, 3);

    // a stream that revisits the same handful of blocks through many fills
    let addrs = [0x1000u64, 0x1080, 0x1100, 0x1000, 0x1180, 0x1080, 0x1200, 0x1000];
    let mut next = 0;
    for cycle in 0..400 {
        if cycle % 20 == 0 && next < addrs.len() {
            let mut ch = upper.write().unwrap();
            assert!(ch.add_rq(load_request(addrs[next], next as u64, &upper), cycle));
            next += 1;
        }
        cache.operate(cycle);
        sink.operate(cycle);
        assert_tag_exclusive(&cache);
    }
    assert!(cache.stats.total_hits() > 0);
}

#[test]
fn hits_are_observed_after_the_hit_latency() {
    let upper = test_channel("up");
    let lower = test_channel("down");
    let hit_latency = 4;
    let mut cache = small_cache(
        CacheConfig {
            hit_latency,
            ..CacheConfig::default()
        },
        vec![upper.clone()],
        lower.clone(),
    );
    let mut sink = SinkUnit::new(lower, 3);

    // warm the block with a first miss
    upper.write().unwrap().add_rq(load_request(0x8000, 1, &upper), 0);
    let mut warm_done = 0;
    for cycle in 0..100 {
        cache.operate(cycle);
        sink.operate(cycle);
        if upper.write().unwrap().pop_ready_response(cycle).is_some() {
            warm_done = cycle;
            break;
        }
    }
    assert!(warm_done > 0);

    let issue = warm_done + 1;
    upper.write().unwrap().add_rq(load_request(0x8000, 2, &upper), issue);
    let mut observed = None;
    for cycle in issue..issue + 50 {
        cache.operate(cycle);
        sink.operate(cycle);
        if observed.is_none() && upper.write().unwrap().pop_ready_response(cycle).is_some() {
            observed = Some(cycle);
            break;
        }
    }
    // one cycle into the read queue, then the tag result after HIT_LATENCY
    assert_eq!(observed, Some(issue + 1 + hit_latency));
    assert_eq!(cache.stats.hits[AccessKind::Load.index()], 1);
}

#[test]
fn dirty_victims_are_written_back_below() {
    let upper = test_channel("up");
    let lower = test_channel("down");
    let mut cache = small_cache(
        CacheConfig {
            sets: 1,
            ways: 1,
            ..CacheConfig::default()
        },
        vec![upper.clone()],
        lower.clone(),
    );
    let mut sink = SinkUnit::new(lower.clone(), 3);

    // a store miss allocates with ownership, leaving the block dirty
    {
        let mut req = MemRequest::new(AccessKind::Write, Address::new(0x1000));
        req.instr_id = 1;
        let mut ch = upper.write().unwrap();
        assert!(ch.add_wq(req, 0));
    }
    for cycle in 0..60 {
        cache.operate(cycle);
        sink.operate(cycle);
    }
    assert_eq!(cache.stats.misses[AccessKind::Rfo.index()], 1);

    // evicting it must push the writeback into the lower write queue
    upper.write().unwrap().add_rq(load_request(0x2000, 2, &upper), 60);
    for cycle in 60..160 {
        cache.operate(cycle);
        sink.operate(cycle);
    }
    assert_eq!(lower.read().unwrap().stats.wq_enqueued, 1);
    assert_eq!(cache.stats.writebacks, 1);
    assert_eq!(sink.writes_seen, 1);
}

#[test]
fn a_full_mshr_stalls_the_read_queue_without_dropping() {
    let upper = test_channel("up");
    let lower = test_channel("down");
    let mut cache = small_cache(
        CacheConfig {
            mshr_size: 1,
            ..CacheConfig::default()
        },
        vec![upper.clone()],
        lower.clone(),
    );
    // a sink with a long delay keeps the first miss outstanding
    let mut sink = SinkUnit::new(lower.clone(), 40);

    {
        let mut ch = upper.write().unwrap();
        assert!(ch.add_rq(load_request(0x1000, 1, &upper), 0));
        assert!(ch.add_rq(load_request(0x2000, 2, &upper), 0));
    }

    for cycle in 0..10 {
        cache.operate(cycle);
        sink.operate(cycle);
    }
    // only the first miss went below; the second still waits in the queue
    assert_eq!(lower.read().unwrap().stats.rq_enqueued, 1);
    assert_eq!(upper.read().unwrap().rq_occupancy(), 1);
    assert_eq!(cache.mshr_occupancy(), 1);

    let mut responses = 0;
    for cycle in 10..300 {
        cache.operate(cycle);
        sink.operate(cycle);
        if upper.write().unwrap().pop_ready_response(cycle).is_some() {
            responses += 1;
        }
    }
    // both eventually complete
    assert_eq!(responses, 2);
    assert_eq!(lower.read().unwrap().stats.rq_enqueued, 2);
}

#[test]
fn the_prefetcher_feeds_the_cache_through_its_own_queue() {
    let upper = test_channel("up");
    let lower = test_channel("down");
    let config = CacheConfig::default();
    let (sets, ways) = (config.sets, config.ways);
    let mut cache = Cache::new(
        "uut",
        config,
        vec![upper.clone()],
        lower.clone(),
        Box::new(Lru::new(sets, ways)),
        Box::new(NextLine),
    );
    let mut sink = SinkUnit::new(lower.clone(), 3);

    upper.write().unwrap().add_rq(load_request(0x4000, 1, &upper), 0);
    for cycle in 0..200 {
        cache.operate(cycle);
        sink.operate(cycle);
        upper.write().unwrap().pop_ready_response(cycle);
    }

    assert!(cache.stats.pf_requested >= 1);
    assert!(cache.stats.pf_issued >= 1, "the next block must have been filled");
    // the demand block and its successor both landed in the array
    let blocks = cache.blocks();
    assert!(blocks.iter().any(|b| b.valid && b.address.value() == 0x4000));
    assert!(blocks.iter().any(|b| b.valid && b.address.value() == 0x4040 && b.prefetch));
}

#[test]
fn demand_hits_on_prefetched_blocks_count_as_useful() {
    let upper = test_channel("up");
    let lower = test_channel("down");
    let config = CacheConfig::default();
    let (sets, ways) = (config.sets, config.ways);
    let mut cache = Cache::new(
        "uut",
        config,
        vec![upper.clone()],
        lower.clone(),
        Box::new(Lru::new(sets, ways)),
        Box::new(NextLine),
    );
    let mut sink = SinkUnit::new(lower.clone(), 3);

    upper.write().unwrap().add_rq(load_request(0x4000, 1, &upper), 0);
    for cycle in 0..200 {
        cache.operate(cycle);
        sink.operate(cycle);
        upper.write().unwrap().pop_ready_response(cycle);
    }
    // touch the prefetched successor
    upper.write().unwrap().add_rq(load_request(0x4040, 2, &upper), 200);
    for cycle in 200..260 {
        cache.operate(cycle);
        sink.operate(cycle);
        upper.write().unwrap().pop_ready_response(cycle);
    }
    assert_eq!(cache.stats.pf_useful, 1);
    assert!(!cache
        .blocks()
        .iter()
        .any(|b| b.valid && b.address.value() == 0x4040 && b.prefetch));
}
