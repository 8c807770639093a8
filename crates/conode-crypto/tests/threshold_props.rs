// Property tests for the threshold primitives.

use conode_crypto::share::{recover_commit, recover_secret};
use conode_crypto::{base_mul, PriPoly, PubShare};
use proptest::prelude::*;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn any_threshold_subset_recovers_the_secret(
        n in 2usize..9,
        seed in any::<u64>(),
    ) {
        let t = conode_crypto::bft_threshold(n);
        let poly = PriPoly::random(t, None);
        let shares = poly.shares(n);

        // Rotate the share list by a seed-dependent offset and take t of them.
        let offset = (seed as usize) % n;
        let subset: Vec<_> = shares.iter().cycle().skip(offset).take(t).copied().collect();
        prop_assert_eq!(recover_secret(&subset, t).unwrap(), poly.secret());

        let commits = poly.commit();
        let pub_subset: Vec<PubShare> = subset.iter().map(|s| commits.eval(s.index)).collect();
        prop_assert_eq!(recover_commit(&pub_subset, t).unwrap(), base_mul(&poly.secret()));
    }

    #[test]
    fn fewer_than_threshold_shares_fail(n in 3usize..9) {
        let t = conode_crypto::bft_threshold(n);
        let poly = PriPoly::random(t, None);
        let shares = poly.shares(t - 1);
        prop_assert!(recover_secret(&shares, t).is_err());
    }
}
