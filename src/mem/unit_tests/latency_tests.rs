use super::common::{load_request, small_cache, test_channel};
use crate::mem::cache::CacheConfig;
use crate::mem::dram::{DramConfig, DramController};
use crate::mem::operable::Operable;

/// A load that misses everywhere can return no sooner than the sum of every
/// level's hit latency, every level's fill latency and the DRAM service
/// time.
#[test]
fn a_full_miss_pays_every_level() {
    let cpu_l1 = test_channel("cpu->l1");
    let l1_l2 = test_channel("l1->l2");
    let l2_llc = test_channel("l2->llc");
    let llc_dram = test_channel("llc->dram");

    let (l1_hit, l1_fill) = (4, 2);
    let (l2_hit, l2_fill) = (8, 3);
    let (llc_hit, llc_fill) = (20, 4);
    let (trp, trcd, tcas) = (20, 20, 32);

    let mut l1 = small_cache(
        CacheConfig {
            hit_latency: l1_hit,
            fill_latency: l1_fill,
            ..CacheConfig::default()
        },
        vec![cpu_l1.clone()],
        l1_l2.clone(),
    );
    let mut l2 = small_cache(
        CacheConfig {
            hit_latency: l2_hit,
            fill_latency: l2_fill,
            sets: 256,
            ..CacheConfig::default()
        },
        vec![l1_l2.clone()],
        l2_llc.clone(),
    );
    let mut llc = small_cache(
        CacheConfig {
            hit_latency: llc_hit,
            fill_latency: llc_fill,
            sets: 512,
            ..CacheConfig::default()
        },
        vec![l2_llc.clone()],
        llc_dram.clone(),
    );
    let mut dram = DramController::new(
        DramConfig {
            trp,
            trcd,
            tcas,
            refresh_period: 0,
            ..DramConfig::default()
        },
        vec![llc_dram.clone()],
    );

    cpu_l1.write().unwrap().add_rq(load_request(0x10000, 1, &cpu_l1), 0);

    let mut observed = None;
    for cycle in 0..2000 {
        l1.operate(cycle);
        l2.operate(cycle);
        llc.operate(cycle);
        dram.operate(cycle);
        if observed.is_none() && cpu_l1.write().unwrap().pop_ready_response(cycle).is_some() {
            observed = Some(cycle);
            break;
        }
    }

    let at = observed.expect("load never returned");
    let lower_bound = (l1_hit + l2_hit + llc_hit) + (l1_fill + l2_fill + llc_fill) + (trp + trcd + tcas);
    assert!(
        at >= lower_bound,
        "round trip {at} undercuts the latency floor {lower_bound}"
    );

    // every level recorded exactly one miss and one fill
    for (cache, name) in [(&l1, "l1"), (&l2, "l2"), (&llc, "llc")] {
        assert_eq!(cache.stats.total_misses(), 1, "{name} miss count");
        assert_eq!(cache.stats.mshr_returns, 1, "{name} fill count");
        assert!(cache.stats.mshr_return_cycles > 0, "{name} return latency");
    }
    assert_eq!(dram.stats()[0].reads_returned, 1);

    // a re-run of the same block now hits in L1 far faster
    let issue = at + 1;
    cpu_l1.write().unwrap().add_rq(load_request(0x10000, 2, &cpu_l1), issue);
    let mut second = None;
    for cycle in issue..issue + 100 {
        l1.operate(cycle);
        l2.operate(cycle);
        llc.operate(cycle);
        dram.operate(cycle);
        if second.is_none() && cpu_l1.write().unwrap().pop_ready_response(cycle).is_some() {
            second = Some(cycle);
            break;
        }
    }
    let second = second.expect("hit never returned");
    assert_eq!(second - issue, 1 + l1_hit);
}
