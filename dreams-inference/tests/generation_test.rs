//! End-to-end generation over toy checkpoints

mod common;

use anyhow::Result;
use dreams_inference::{
    BOS_TOKEN_ID, InferenceConfig, LatestText, OUTPUT_CAPACITY, OutputSink, Sampler, Session, Tokenizer,
    TransformerBuilder, run_encode,
};

use common::{CAT_VOCAB, ToyModel, toy_model};

#[derive(Default)]
struct Recorder {
    fragments: Vec<String>,
    published: Vec<String>,
}

impl OutputSink for Recorder {
    fn on_fragment(&mut self, fragment: &str) {
        self.fragments.push(fragment.to_owned());
    }

    fn publish(&mut self, text: &str) {
        self.published.push(text.to_owned());
    }
}

fn load_session(model: &ToyModel, seed: u64) -> Result<Session> {
    let config = InferenceConfig::builder()
        .checkpoint_path(Some(&model.checkpoint))
        .seed(Some(seed))
        .build()
        .map_err(anyhow::Error::msg)?;

    Ok(Session::load(&config)?)
}

#[test]
fn cat_merges_into_a_single_token() -> Result<()> {
    let model = toy_model(&CAT_VOCAB, true)?;
    let tokenizer = Tokenizer::from_file(&model.tokenizer, CAT_VOCAB.len())?;

    let tokens = tokenizer.encode("cat", true, false);

    assert_eq!(tokens, vec![BOS_TOKEN_ID, 3]);
    assert_eq!(tokenizer.decode(BOS_TOKEN_ID, 3), "cat");
    assert_eq!(tokenizer.decode(4, 3), " cat");
    assert_eq!(run_encode(&model.checkpoint, &model.tokenizer, "cat")?, tokens);

    Ok(())
}

#[test]
fn same_seed_reproduces_the_same_tokens() -> Result<()> {
    let model = toy_model(&CAT_VOCAB, true)?;

    let mut session = load_session(&model, 1234)?;
    let first = session.generate(None, 5, &mut Recorder::default(), |_| {});
    let second = session.generate(None, 5, &mut Recorder::default(), |_| {});

    let mut other = load_session(&model, 1234)?;
    let third = other.generate(None, 5, &mut Recorder::default(), |_| {});

    assert_eq!(first.tokens.len(), 5);
    assert_eq!(first.tokens, second.tokens);
    assert_eq!(first.tokens, third.tokens);
    assert_eq!(first.text, third.text);
    assert!(first.tokens.iter().all(|&t| t < CAT_VOCAB.len()));

    Ok(())
}

#[test]
fn prompt_is_replayed_before_sampling() -> Result<()> {
    let model = toy_model(&CAT_VOCAB, true)?;
    let mut session = load_session(&model, 99)?;

    let generation = session.generate(Some("cat cat"), 10, &mut Recorder::default(), |_| {});

    let prompt = session.tokenizer().encode("cat cat", true, false);
    assert_eq!(&generation.tokens[..prompt.len() - 1], &prompt[1..]);
    assert!(generation.text.starts_with("cat cat"), "{:?}", generation.text);

    Ok(())
}

#[test]
fn completion_and_publish_happen_once() -> Result<()> {
    let model = toy_model(&CAT_VOCAB, true)?;
    let mut session = load_session(&model, 5)?;
    let mut recorder = Recorder::default();
    let mut completions = Vec::new();

    let generation = session.generate(None, 0, &mut recorder, |tps| completions.push(tps));

    assert_eq!(completions.len(), 1);
    assert!(completions[0] >= 0.0);
    assert_eq!(recorder.published, vec![generation.text.clone()]);
    assert_eq!(recorder.fragments.concat(), generation.text);
    // a budget of 0 means the whole context window, minus an early stop at a sentence end
    assert!(generation.tokens.len() <= model.config.seq_len);

    Ok(())
}

#[test]
fn latest_text_sees_the_published_output() -> Result<()> {
    let model = toy_model(&CAT_VOCAB, true)?;
    let mut session = load_session(&model, 17)?;
    let latest = LatestText::new();

    let generation = session.generate(Some("cat"), 6, &mut latest.clone(), |_| {});

    assert_eq!(latest.get(), generation.text);

    Ok(())
}

#[test]
fn output_stays_within_capacity() -> Result<()> {
    // every token decodes to 600 bytes, far more than the buffer holds over the context
    let entries: Vec<(String, f32)> = (b'a'..=b'j').map(|c| ((c as char).to_string().repeat(600), 0.0)).collect();
    let model = toy_model(&entries, false)?;

    let transformer = TransformerBuilder::new(&model.checkpoint).build()?;
    let tokenizer = Tokenizer::from_file(&model.tokenizer, entries.len())?;
    let sampler = Sampler::new(entries.len(), 1.0, 1.0, 3);
    let mut session = Session::new(transformer, tokenizer, sampler);
    let mut recorder = Recorder::default();

    let generation = session.generate(None, 0, &mut recorder, |_| {});

    let streamed: usize = recorder.fragments.iter().map(String::len).sum();
    assert_eq!(generation.tokens.len(), model.config.seq_len);
    assert!(streamed > OUTPUT_CAPACITY);
    assert!(generation.text.len() < OUTPUT_CAPACITY);
    // the run never leaves its single sentence, so it is closed with a period
    assert!(generation.text.ends_with('.'));

    Ok(())
}
