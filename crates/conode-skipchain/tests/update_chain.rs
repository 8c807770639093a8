// UPDATE CHAIN PROPERTIES
// For any chain shape the shortcut walk ends where the level-0 walk ends
// and every hop of it verifies.

use std::sync::Arc;

use conode_onet::LocalCothority;
use conode_skipchain::{
    verify_update_chain, GetUpdateChain, SkipBlock, SkipBlockDb, SkipchainConfig, SkipchainService, StoreSkipBlock,
};
use proptest::prelude::*;

fn config(base_height: u32, max_height: u32) -> SkipchainConfig {
    SkipchainConfig {
        base_height,
        max_height,
        branching: 0,
        cosi_timeout_ms: 3_000,
        cosi_soft_timeout_ms: 200,
        propagate_timeout_ms: 500,
    }
}

/// Builds a chain of `length` blocks after the genesis on a single conode
/// and returns the genesis together with the service holding it.
async fn build_chain(
    base_height: u32,
    max_height: u32,
    length: usize,
) -> (LocalCothority, SkipBlock, Arc<SkipchainService>) {
    let local = LocalCothority::new(1);
    let service = SkipchainService::new(local.servers[0].clone(), SkipBlockDb::in_memory(), config(base_height, max_height));
    let genesis = service
        .store_skip_block(StoreSkipBlock {
            latest_id: None,
            new_block: SkipBlock::new(local.roster.clone(), base_height, max_height, vec![], b"genesis".to_vec()),
        })
        .await
        .unwrap()
        .latest;

    let mut latest = genesis.clone();
    for i in 0..length {
        let proposal = SkipBlock::new(latest.roster.clone(), 0, 0, vec![], (i as u64).to_le_bytes().to_vec());
        latest = service
            .store_skip_block(StoreSkipBlock {
                latest_id: Some(latest.hash),
                new_block: proposal,
            })
            .await
            .unwrap()
            .latest;
    }
    (local, genesis, service)
}

fn level_zero_tip(db: &SkipBlockDb, genesis: &SkipBlock) -> SkipBlock {
    let mut current = db.get(&genesis.hash).unwrap();
    while let Some(link) = current.forward_links.first() {
        current = db.get(&link.to).unwrap();
    }
    current
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    #[test]
    fn update_chain_ends_at_the_level_zero_tip(
        base_height in 2u32..5,
        max_height in 1u32..5,
        length in 0usize..24,
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let (_local, genesis, service) = build_chain(base_height, max_height, length).await;
            let tip = level_zero_tip(service.db(), &genesis);
            prop_assert_eq!(tip.index, length as u64);

            let update = service
                .get_update_chain(&GetUpdateChain { latest_id: genesis.hash })
                .unwrap()
                .update;
            prop_assert_eq!(update.first().map(|b| b.hash), Some(genesis.hash));
            prop_assert_eq!(update.last().map(|b| b.hash), Some(tip.hash));
            prop_assert!(update.len() <= length + 1);
            prop_assert!(verify_update_chain(&update).is_ok());
            Ok(())
        })?;
    }
}
