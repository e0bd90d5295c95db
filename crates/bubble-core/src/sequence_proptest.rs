#[cfg(test)]
mod proptest_sequence {
    use crate::sequence::*;
    use proptest::prelude::*;

    fn step_char() -> impl Strategy<Value = char> {
        prop::sample::select(vec!['d', 'n', 'e', 'b', 's', 'h'])
    }

    fn token() -> impl Strategy<Value = (char, u64, Option<i64>)> {
        (step_char(), 1u64..=600_000, prop::option::of(-100_000i64..=100_000))
    }

    fn render(tokens: &[(char, u64, Option<i64>)], motor: bool) -> String {
        let mut text = String::new();
        if motor {
            text.push('M');
        }
        for (c, ms, pos) in tokens {
            text.push(*c);
            text.push_str(&ms.to_string());
            if let (true, Some(pos)) = (motor, pos) {
                text.push('m');
                text.push_str(&pos.to_string());
            }
        }
        text
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(2000))]

        // Property: without the motor marker a suffix is a bad step type
        #[test]
        fn plain_sequences_reject_motor_suffix(
            tokens in prop::collection::vec(token(), 1..20),
            pos in 0i64..=100_000,
        ) {
            let mut text = render(&tokens, false);
            text.push_str(&format!("m{pos}"));
            let is_bad_step = matches!(
                SequenceParser::new(true).parse_lines(&text, ""),
                Err(ParseError::InvalidStepType { found: 'm', .. })
            );
            prop_assert!(is_bad_step);
        }

        // Property: step count and total duration follow the token stream
        #[test]
        fn totals_match_tokens(
            tokens in prop::collection::vec(token(), 1..40),
            motor in any::<bool>(),
        ) {
            let text = render(&tokens, motor);
            let seq = SequenceParser::new(true).parse_lines(&text, "").unwrap();

            prop_assert_eq!(seq.len(), tokens.len());
            let expected: u64 = tokens.iter().map(|t| t.1).sum();
            prop_assert_eq!(seq.total_duration_ms, expected);
            prop_assert_eq!(seq.total_duration_ms, seq.steps.iter().map(|s| s.duration_ms).sum::<u64>());
            prop_assert_eq!(seq.requires_motor, motor);

            for (step, (c, ms, pos)) in seq.steps.iter().zip(tokens.iter()) {
                prop_assert_eq!(step.step_type.as_char(), *c);
                prop_assert_eq!(step.duration_ms, *ms);
                let expected = if motor { Some(pos.unwrap_or(0)) } else { None };
                prop_assert_eq!(step.motor_position, expected);
            }
        }

        // Property: every parsed step has a positive duration
        #[test]
        fn durations_always_positive(text in "[dnebshmM0-9-]{0,40}") {
            if let Ok(seq) = SequenceParser::new(true).parse_lines(&text, "") {
                prop_assert!(!seq.is_empty());
                prop_assert!(seq.steps.iter().all(|s| s.duration_ms > 0));
            }
        }

        // Property: motor sequences are never accepted without a ready motor
        #[test]
        fn motor_marker_requires_ready_motor(tokens in prop::collection::vec(token(), 1..10)) {
            let text = render(&tokens, true);
            prop_assert_eq!(
                SequenceParser::new(false).parse_lines(&text, ""),
                Err(ParseError::MotorNotReady)
            );
        }
    }
}
