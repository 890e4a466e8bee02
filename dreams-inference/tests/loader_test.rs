//! Integration tests for checkpoint and vocabulary loading

mod common;

use anyhow::Result;
use dreams_inference::{LoadError, Tokenizer, TransformerBuilder, TransformerWeights, Vocabulary, load_config};

use common::{CAT_VOCAB, header, model_config, toy_model, toy_weights, write_checkpoint, write_vocabulary};

#[test]
fn loading_twice_is_bit_identical() -> Result<()> {
    let model = toy_model(&CAT_VOCAB, true)?;

    let first = TransformerBuilder::new(&model.checkpoint).build()?;
    let second = TransformerBuilder::new(&model.checkpoint).build()?;

    assert_eq!(first.config(), second.config());
    assert_eq!(*first.config(), model.config);

    let bits = |region: &[f32]| region.iter().map(|v| v.to_bits()).collect::<Vec<_>>();
    assert_eq!(bits(first.weights().region()), bits(second.weights().region()));
    assert_eq!(first.weights().layers, second.weights().layers);
    assert_eq!(first.weights().classifier, first.weights().token_embedding);

    Ok(())
}

#[test]
fn truncated_weights_are_a_short_read() -> Result<()> {
    let model = toy_model(&CAT_VOCAB, true)?;
    let floats = TransformerWeights::required_floats(&model.config, 0)?;
    write_checkpoint(&model.checkpoint, header(-10), &toy_weights(floats - 5, 7))?;

    let err = TransformerBuilder::new(&model.checkpoint).build().unwrap_err();

    match err {
        LoadError::ShortRead { expected, actual, .. } => {
            assert_eq!(expected, floats * 4);
            assert_eq!(actual, (floats - 5) * 4);
        }
        other => panic!("unexpected error: {other}"),
    }

    Ok(())
}

#[test]
fn missing_or_headerless_checkpoint_is_an_io_error() -> Result<()> {
    let model = toy_model(&CAT_VOCAB, true)?;

    let missing = model.dir.path().join("absent.bin");
    let err = TransformerBuilder::new(&missing).build().unwrap_err();
    assert!(matches!(err, LoadError::Io { .. }), "{err}");

    std::fs::write(&model.checkpoint, [0u8; 10])?;
    let err = load_config(&model.checkpoint).unwrap_err();
    assert!(matches!(err, LoadError::Io { .. }), "{err}");

    Ok(())
}

#[test]
fn legacy_rope_table_is_skipped() -> Result<()> {
    let model = toy_model(&CAT_VOCAB, false)?;
    let config = model_config(CAT_VOCAB.len(), false);

    let plain = TransformerWeights::required_floats(&config, 0)?;
    let legacy = config.seq_len * config.head_size();
    let mut floats = toy_weights(plain + legacy, 11);
    let classifier_start = floats.len() - config.vocab_size * config.dim;
    floats[classifier_start..].iter_mut().for_each(|v| *v = 0.5);
    write_checkpoint(&model.checkpoint, header(10), &floats)?;

    let transformer = TransformerBuilder::new(&model.checkpoint).build()?;
    let weights = transformer.weights();

    assert!(weights.get(weights.classifier).iter().all(|&v| v == 0.5));
    assert_eq!(weights.region().len(), plain + legacy);

    Ok(())
}

#[test]
fn context_override_only_shrinks() -> Result<()> {
    let model = toy_model(&CAT_VOCAB, true)?;

    let shrunk = TransformerBuilder::new(&model.checkpoint).with_ctx_length(Some(8)).build()?;
    assert_eq!(shrunk.config().seq_len, 8);

    let ignored = TransformerBuilder::new(&model.checkpoint).with_ctx_length(Some(1000)).build()?;
    assert_eq!(ignored.config().seq_len, model.config.seq_len);

    // the weight layout keeps following the on-disk header
    assert_eq!(shrunk.weights().region().len(), ignored.weights().region().len());

    Ok(())
}

#[test]
fn invalid_header_is_rejected() -> Result<()> {
    let model = toy_model(&CAT_VOCAB, true)?;
    let mut bad = header(-10);
    bad[4] = 3;
    write_checkpoint(&model.checkpoint, bad, &[])?;

    let err = TransformerBuilder::new(&model.checkpoint).build().unwrap_err();
    assert!(matches!(err, LoadError::InvalidHeader(_)), "{err}");

    Ok(())
}

#[test]
fn vocabulary_round_trips_through_the_file_format() -> Result<()> {
    let model = toy_model(&CAT_VOCAB, true)?;

    let vocab = Vocabulary::load(&model.tokenizer, CAT_VOCAB.len())?;

    assert_eq!(vocab.len(), CAT_VOCAB.len());
    assert_eq!(vocab.tokens[3], b" cat");
    assert_eq!(vocab.scores[3], 0.9);
    assert_eq!(vocab.max_token_length, 5);

    Ok(())
}

#[test]
fn short_vocabulary_is_a_short_read() -> Result<()> {
    let model = toy_model(&CAT_VOCAB, true)?;
    write_vocabulary(&model.tokenizer, &CAT_VOCAB[..4])?;

    let err = Tokenizer::from_file(&model.tokenizer, CAT_VOCAB.len()).unwrap_err();
    assert!(matches!(err, LoadError::ShortRead { .. }), "{err}");

    Ok(())
}
